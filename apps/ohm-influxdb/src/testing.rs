//! In-memory sensor source and sink for cycle and service tests.

use crate::sensors::{Device, SensorReading, SensorSource};
use crate::sink::{MetricsSink, Point, SinkError};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Update,
    Sensors,
    Panic,
}

/// Counters shared between a fake source and the test body.
#[derive(Debug, Default)]
pub struct Activity {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub updates: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

pub struct FakeDevice {
    identifier: String,
    readings: Vec<SensorReading>,
    fault: Fault,
    delay: Duration,
    activity: Arc<Activity>,
}

impl FakeDevice {
    pub fn new(identifier: &str, readings: Vec<SensorReading>) -> Self {
        Self {
            identifier: identifier.to_string(),
            readings,
            fault: Fault::None,
            delay: Duration::ZERO,
            activity: Arc::new(Activity::default()),
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Device for FakeDevice {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn update(&mut self) -> Result<()> {
        let active = self.activity.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.activity.max_active.fetch_max(active, Ordering::SeqCst);
        self.activity.updates.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.activity.active.fetch_sub(1, Ordering::SeqCst);

        match self.fault {
            Fault::Update => Err(anyhow!("{} stopped responding", self.identifier)),
            Fault::Panic => panic!("{} driver crashed", self.identifier),
            _ => Ok(()),
        }
    }

    fn sensors(&self) -> Result<Vec<SensorReading>> {
        if self.fault == Fault::Sensors {
            return Err(anyhow!("{} sensor table unreadable", self.identifier));
        }
        Ok(self.readings.clone())
    }
}

pub struct FakeSource {
    devices: Vec<Box<dyn Device>>,
    activity: Arc<Activity>,
    fail_open: bool,
}

impl FakeSource {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        let activity = Arc::new(Activity::default());
        let devices = devices
            .into_iter()
            .map(|mut device| {
                device.activity = activity.clone();
                Box::new(device) as Box<dyn Device>
            })
            .collect();
        Self {
            devices,
            activity,
            fail_open: false,
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }
}

impl SensorSource for FakeSource {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(anyhow!("hardware access denied"));
        }
        self.activity.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.activity.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn devices_mut(&mut self) -> &mut [Box<dyn Device>] {
        &mut self.devices
    }
}

#[derive(Default)]
pub struct RecordingSink {
    points: Mutex<Vec<Point>>,
    reject_series: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(series: &str) -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            reject_series: Some(series.to_string()),
        }
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    /// Points other than the `iterations` counter.
    pub fn sensor_points(&self) -> Vec<Point> {
        self.points()
            .into_iter()
            .filter(|point| point.series != "iterations")
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn write(&self, point: Point) -> Result<(), SinkError> {
        if self.reject_series.as_deref() == Some(point.series.as_str()) {
            return Err(SinkError::QueueFull);
        }
        self.points.lock().unwrap().push(point);
        Ok(())
    }
}

pub fn reading(identifier: &str, name: &str, value: Option<f64>) -> SensorReading {
    SensorReading::new(identifier, name, value)
}

/// Collects formatted log output so tests can assert on what was logged.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Runs `f` with a subscriber that writes into this buffer.
    pub fn during<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
