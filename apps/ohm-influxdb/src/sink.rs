use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use url::Url;

const DEFAULT_BATCH_SIZE: usize = 5_000;
const DEFAULT_MAX_BUFFERED: usize = 100_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

/// One line of line protocol before the sink's constant tags are applied.
/// `timestamp` is epoch seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub series: String,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: i64,
}

impl Point {
    pub fn new(series: impl Into<String>, timestamp: i64) -> Self {
        Self {
            series: series.into(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics queue is full")]
    QueueFull,
    #[error("metrics sink is closed")]
    Closed,
    #[error("influxdb request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("influxdb returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl SinkError {
    /// Transport failures, 5xx and 429 may succeed later. Any other rejection
    /// (bad line, type conflict, unknown database) fails the same way forever.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transport(_) => true,
            SinkError::Status { status, .. } => *status >= 500 || *status == 429,
            SinkError::QueueFull | SinkError::Closed => false,
        }
    }
}

/// Where collected points go. `write` only enqueues; delivery problems are
/// reported out of band.
pub trait MetricsSink: Send + Sync {
    fn write(&self, point: Point) -> Result<(), SinkError>;

    fn increment(&self, counter: &str, timestamp: i64) -> Result<(), SinkError> {
        self.write(Point::new(counter, timestamp).with_field("count", 1i64))
    }
}

pub type ErrorHandler = Arc<dyn Fn(&SinkError) + Send + Sync>;

/// Write endpoint plus the tags stamped on every point.
#[derive(Debug, Clone)]
pub struct InfluxTarget {
    write_url: Url,
    tags: Vec<(String, String)>,
}

impl InfluxTarget {
    pub fn new(address: &Url, database: &str) -> Result<Self> {
        let mut write_url = address
            .join("write")
            .with_context(|| format!("invalid influxdb address {address}"))?;
        write_url
            .query_pairs_mut()
            .append_pair("db", database)
            .append_pair("precision", "s");
        Ok(Self {
            write_url,
            tags: Vec::new(),
        })
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self.tags.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub points_sent: AtomicU64,
    pub points_dropped: AtomicU64,
    pub flush_failures: AtomicU64,
}

#[derive(Debug)]
enum SinkCommand {
    Point(Point),
    #[cfg(test)]
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background batching task. Cheap to clone.
#[derive(Clone)]
pub struct InfluxSink {
    tx: mpsc::Sender<SinkCommand>,
    stats: Arc<SinkStats>,
}

pub struct InfluxSinkBuilder {
    target: InfluxTarget,
    flush_interval: Duration,
    batch_size: usize,
    max_buffered: usize,
    on_error: ErrorHandler,
}

impl InfluxSink {
    pub fn builder(target: InfluxTarget) -> InfluxSinkBuilder {
        InfluxSinkBuilder {
            target,
            flush_interval: Duration::from_secs(5),
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffered: DEFAULT_MAX_BUFFERED,
            on_error: Arc::new(|err: &SinkError| {
                tracing::error!(error=%err, "failed to send metrics to influxdb");
            }),
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }

    /// Sends everything buffered so far and waits for the attempt to finish.
    #[cfg(test)]
    pub async fn flush(&self) -> Result<(), SinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Flush(tx))
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)
    }

    /// Final flush, then stops the background task. Other clones start
    /// failing with [`SinkError::Closed`].
    pub async fn shutdown(&self) -> Result<(), SinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Shutdown(tx))
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)
    }
}

impl MetricsSink for InfluxSink {
    fn write(&self, point: Point) -> Result<(), SinkError> {
        self.tx.try_send(SinkCommand::Point(point)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                self.stats.points_dropped.fetch_add(1, Ordering::Relaxed);
                SinkError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

impl InfluxSinkBuilder {
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    /// Called from the background task for every failed delivery.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SinkError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.on_error = handler;
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<(InfluxSink, JoinHandle<()>)> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build influxdb http client")?;
        let (tx, rx) = mpsc::channel(self.max_buffered);
        let stats = Arc::new(SinkStats::default());

        let flush_interval = self.flush_interval;
        let worker = self.into_worker(client, stats.clone());
        let handle = tokio::spawn(worker.run(rx, flush_interval));

        Ok((InfluxSink { tx, stats }, handle))
    }

    fn into_worker(self, client: Client, stats: Arc<SinkStats>) -> Worker {
        Worker {
            client,
            target: self.target,
            batch_size: self.batch_size,
            max_buffered: self.max_buffered,
            on_error: self.on_error,
            stats,
            buffer: VecDeque::with_capacity(self.batch_size),
            backing_off: false,
        }
    }
}

struct Worker {
    client: Client,
    target: InfluxTarget,
    batch_size: usize,
    max_buffered: usize,
    on_error: ErrorHandler,
    stats: Arc<SinkStats>,
    buffer: VecDeque<Point>,
    // Set after a retryable failure; full batches wait for the next tick.
    backing_off: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<SinkCommand>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(SinkCommand::Point(point)) => {
                            self.push(point);
                            if self.buffer.len() >= self.batch_size && !self.backing_off {
                                self.flush().await;
                            }
                        }
                        #[cfg(test)]
                        Some(SinkCommand::Flush(done)) => {
                            self.flush().await;
                            let _ = done.send(());
                        }
                        Some(SinkCommand::Shutdown(done)) => {
                            rx.close();
                            let mut waiters = vec![done];
                            while let Ok(cmd) = rx.try_recv() {
                                match cmd {
                                    SinkCommand::Point(point) => self.push(point),
                                    #[cfg(test)]
                                    SinkCommand::Flush(done) => waiters.push(done),
                                    SinkCommand::Shutdown(done) => waiters.push(done),
                                }
                            }
                            self.flush().await;
                            for done in waiters {
                                let _ = done.send(());
                            }
                            break;
                        }
                        None => {
                            self.flush().await;
                            break;
                        }
                    }
                }
            }
        }

        if !self.buffer.is_empty() {
            tracing::warn!(points = self.buffer.len(), "metrics sink stopped with unsent points");
        }
    }

    fn push(&mut self, point: Point) {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.stats.points_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.buffer.push_back(point);
    }

    /// Sends the buffer oldest first, at most `batch_size` lines per request.
    /// Stops at the first retryable failure and keeps what is left; a batch
    /// the server rejects outright is dropped.
    async fn flush(&mut self) {
        self.backing_off = false;
        while !self.buffer.is_empty() {
            let len = self.buffer.len().min(self.batch_size);
            let body = encode_batch(self.buffer.iter().take(len), &self.target.tags);
            match self.send(body).await {
                Ok(()) => {
                    self.buffer.drain(..len);
                    self.stats.points_sent.fetch_add(len as u64, Ordering::Relaxed);
                    tracing::debug!(len, "flushed metrics batch");
                }
                Err(err) if err.is_retryable() => {
                    self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                    self.backing_off = true;
                    (self.on_error)(&err);
                    return;
                }
                Err(err) => {
                    self.buffer.drain(..len);
                    self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                    self.stats.points_dropped.fetch_add(len as u64, Ordering::Relaxed);
                    tracing::warn!(len, "influxdb rejected metrics batch; dropping it");
                    (self.on_error)(&err);
                }
            }
        }
    }

    async fn send(&self, body: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.target.write_url.clone())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

fn encode_batch<'a>(points: impl Iterator<Item = &'a Point>, tags: &[(String, String)]) -> String {
    let mut out = String::new();
    for point in points {
        encode_line(point, tags, &mut out);
        out.push('\n');
    }
    out
}

/// `series,tag=v field=1.5,count=1i 1700000000`
fn encode_line(point: &Point, tags: &[(String, String)], out: &mut String) {
    escape_into(&point.series, &[',', ' '], out);
    for (key, value) in tags {
        out.push(',');
        escape_into(key, &[',', '=', ' '], out);
        out.push('=');
        escape_into(value, &[',', '=', ' '], out);
    }
    out.push(' ');
    for (idx, (key, value)) in point.fields.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        escape_into(key, &[',', '=', ' '], out);
        out.push('=');
        let _ = match value {
            FieldValue::Float(v) => write!(out, "{v}"),
            FieldValue::Integer(v) => write!(out, "{v}i"),
        };
    }
    let _ = write!(out, " {}", point.timestamp);
}

fn escape_into(raw: &str, special: &[char], out: &mut String) {
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
