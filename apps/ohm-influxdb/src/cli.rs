use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ohm-influxdb",
    version,
    about = "Extract hardware sensor data and export it to InfluxDB"
)]
pub struct Args {
    /// JSON config file; defaults to $OHM_INFLUX_CONFIG or ./ohm-influxdb.json
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Log every point on every cycle, not just the first
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}
