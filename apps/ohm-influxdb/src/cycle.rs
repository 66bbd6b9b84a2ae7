use crate::normalize::normalize;
use crate::sensors::{SensorReading, SensorSource};
use crate::sink::{MetricsSink, Point};
use std::time::{Duration, Instant};

pub const ITERATIONS_COUNTER: &str = "iterations";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub written: usize,
    pub missing: usize,
    pub failed: usize,
    pub failed_devices: usize,
    pub elapsed: Duration,
}

/// Runs one pass over the sensor source per call.
///
/// The first pass logs every point it writes; after that only the summary line
/// is logged unless the runner was built with `always_verbose`.
#[derive(Debug)]
pub struct CollectionCycle {
    verbose: bool,
    always_verbose: bool,
}

impl CollectionCycle {
    pub fn new(always_verbose: bool) -> Self {
        Self {
            verbose: true,
            always_verbose,
        }
    }

    /// Every point written in this pass, the `iterations` counter included,
    /// carries `timestamp`.
    pub fn run(
        &mut self,
        source: &mut dyn SensorSource,
        sink: &dyn MetricsSink,
        timestamp: i64,
    ) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        if let Err(err) = sink.increment(ITERATIONS_COUNTER, timestamp) {
            tracing::warn!(error=%err, "failed to record iteration counter");
        }

        for device in source.devices_mut() {
            if let Err(err) = device.update() {
                tracing::warn!(device = device.identifier(), error=%err, "failed to update device; skipping");
                report.failed_devices += 1;
                continue;
            }
            let readings = match device.sensors() {
                Ok(readings) => readings,
                Err(err) => {
                    tracing::warn!(device = device.identifier(), error=%err, "failed to read device sensors; skipping");
                    report.failed_devices += 1;
                    continue;
                }
            };

            for reading in &readings {
                self.publish(reading, sink, timestamp, &mut report);
            }
        }

        if !self.always_verbose {
            self.verbose = false;
        }

        report.elapsed = started.elapsed();
        let elapsed_ms = report.elapsed.as_secs_f64() * 1000.0;
        tracing::info!(
            written = report.written,
            missing = report.missing,
            failed = report.failed,
            failed_devices = report.failed_devices,
            "sent {} metrics in {:.1}ms",
            report.written,
            elapsed_ms
        );
        report
    }

    fn publish(
        &self,
        reading: &SensorReading,
        sink: &dyn MetricsSink,
        timestamp: i64,
        report: &mut CycleReport,
    ) {
        // A missing value is not the same as a zero reading (a fan at 0 RPM).
        let Some(value) = reading.value else {
            tracing::warn!(sensor = %reading.identifier, "{} did not have a value", reading.identifier);
            report.missing += 1;
            return;
        };
        if !value.is_finite() {
            tracing::warn!(sensor = %reading.identifier, value, "sensor reported a non-finite value");
            report.missing += 1;
            return;
        }

        let key = match normalize(&reading.identifier, &reading.name) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(sensor = %reading.identifier, error=%err, "skipping sensor");
                report.failed += 1;
                return;
            }
        };

        if self.verbose {
            tracing::info!("sensor: {} - {} ({})", key.series, key.field, value);
        }

        let point = Point::new(key.series, timestamp).with_field(key.field, value);
        match sink.write(point) {
            Ok(()) => report.written += 1,
            Err(err) => {
                tracing::warn!(sensor = %reading.identifier, error=%err, "failed to write sensor point");
                report.failed += 1;
            }
        }
    }
}
