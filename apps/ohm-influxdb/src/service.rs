use crate::cycle::CollectionCycle;
use crate::sensors::SensorSource;
use crate::sink::MetricsSink;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How long `stop` waits for an in-flight cycle before giving up on it.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

struct Collector {
    source: Box<dyn SensorSource>,
    cycle: CollectionCycle,
}

type SharedCollector = Arc<Mutex<Collector>>;

// A panic mid-cycle poisons the lock; the hardware handle is still usable.
fn lock(collector: &SharedCollector) -> MutexGuard<'_, Collector> {
    collector.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the sensor source for the lifetime of the service and drives one
/// collection cycle per tick from a single worker task.
pub struct MetricService {
    collector: SharedCollector,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl MetricService {
    /// Opens the sensor source and starts ticking. Failing to open the source
    /// is the only fatal error.
    pub async fn start(
        source: Box<dyn SensorSource>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
        cycle: CollectionCycle,
    ) -> Result<Self> {
        let mut source = source;
        let source = tokio::task::spawn_blocking(move || -> Result<Box<dyn SensorSource>> {
            source.open().context("failed to open hardware sensors")?;
            Ok(source)
        })
        .await??;

        let collector = Arc::new(Mutex::new(Collector { source, cycle }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(
            collector.clone(),
            sink,
            interval,
            shutdown_rx,
        ));

        tracing::info!(interval_secs = interval.as_secs_f64(), "metric collection started");
        Ok(Self {
            collector,
            shutdown_tx,
            worker,
        })
    }

    /// Stops ticking, lets an in-flight cycle finish (bounded by
    /// [`STOP_GRACE_PERIOD`]) and closes the sensor source.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let mut worker = self.worker;
        match tokio::time::timeout(STOP_GRACE_PERIOD, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error=%err, "collection worker failed"),
            Err(_) => {
                tracing::warn!(
                    grace_secs = STOP_GRACE_PERIOD.as_secs(),
                    "collection cycle still running; sensors close once it finishes"
                );
                worker.abort();
            }
        }

        // Taking the lock waits out any cycle still reading hardware.
        let collector = self.collector;
        tokio::task::spawn_blocking(move || {
            lock(&collector).source.close();
        })
        .await
        .context("failed to close hardware sensors")?;
        tracing::info!("metric collection stopped");
        Ok(())
    }
}

async fn run_worker(
    collector: SharedCollector,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        // One timestamp per tick, however long sampling and sending take.
        let timestamp = Utc::now().timestamp();
        let started = Instant::now();

        let task_collector = collector.clone();
        let task_sink = sink.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&task_collector);
            let Collector { source, cycle } = &mut *guard;
            cycle.run(&mut **source, task_sink.as_ref(), timestamp)
        })
        .await;

        if let Err(err) = result {
            tracing::error!(error=%err, "unable to send metrics; collection cycle aborted");
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "collection cycle overran interval; skipping missed ticks"
            );
        }
    }
}
