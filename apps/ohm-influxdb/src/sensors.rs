use anyhow::{anyhow, Result};
use sysinfo::{Components, Disks, System};

/// One reading taken from a device during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub identifier: String,
    pub name: String,
    pub value: Option<f64>,
}

impl SensorReading {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            value,
        }
    }
}

/// A piece of hardware exposing sensors. `update` refreshes the cached values
/// that `sensors` then reports.
pub trait Device: Send {
    fn identifier(&self) -> &str;
    fn update(&mut self) -> Result<()>;
    fn sensors(&self) -> Result<Vec<SensorReading>>;
}

/// The machine's hardware tree. Opened once when the service starts and closed
/// once when it stops; not safe for concurrent use.
pub trait SensorSource: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn devices_mut(&mut self) -> &mut [Box<dyn Device>];
}

/// Sensor source backed by `sysinfo`: CPU load and clocks, memory usage, disk
/// usage and whatever thermal components the OS reports.
#[derive(Default)]
pub struct SystemSensors {
    devices: Vec<Box<dyn Device>>,
}

impl SystemSensors {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensorSource for SystemSensors {
    fn open(&mut self) -> Result<()> {
        let mut devices: Vec<Box<dyn Device>> = Vec::new();

        let cpu = CpuDevice::new();
        if cpu.core_count() == 0 {
            return Err(anyhow!("no CPUs reported by the operating system"));
        }
        devices.push(Box::new(cpu));
        devices.push(Box::new(MemoryDevice::new()));

        let disks = DiskDevice::new();
        if disks.is_empty() {
            tracing::warn!("no disks found; disk usage will not be reported");
        } else {
            devices.push(Box::new(disks));
        }

        let thermal = ThermalDevice::new();
        if thermal.is_empty() {
            tracing::warn!("no thermal sensors found; temperatures will not be reported");
        } else {
            devices.push(Box::new(thermal));
        }

        tracing::info!(devices = devices.len(), "hardware sensors opened");
        self.devices = devices;
        Ok(())
    }

    fn close(&mut self) {
        self.devices.clear();
        tracing::info!("hardware sensors closed");
    }

    fn devices_mut(&mut self) -> &mut [Box<dyn Device>] {
        &mut self.devices
    }
}

struct CpuDevice {
    system: System,
}

impl CpuDevice {
    fn new() -> Self {
        let mut system = System::new();
        // Usage is a delta between two refreshes; prime the first sample.
        system.refresh_cpu_all();
        Self { system }
    }

    fn core_count(&self) -> usize {
        self.system.cpus().len()
    }
}

impl Device for CpuDevice {
    fn identifier(&self) -> &str {
        "/cpu/0"
    }

    fn update(&mut self) -> Result<()> {
        self.system.refresh_cpu_all();
        Ok(())
    }

    fn sensors(&self) -> Result<Vec<SensorReading>> {
        let mut readings = Vec::with_capacity(self.core_count() * 2 + 1);
        readings.push(SensorReading::new(
            "/cpu/0/load/0",
            "CPU Total",
            finite(self.system.global_cpu_usage()),
        ));
        for (idx, cpu) in self.system.cpus().iter().enumerate() {
            readings.push(SensorReading::new(
                format!("/cpu/0/load/{}", idx + 1),
                format!("CPU Core #{}", idx + 1),
                finite(cpu.cpu_usage()),
            ));
        }
        // sysinfo reports 0 MHz where the platform exposes no frequency.
        for (idx, cpu) in self.system.cpus().iter().enumerate() {
            let mhz = cpu.frequency();
            readings.push(SensorReading::new(
                format!("/cpu/0/clock/{}", idx + 1),
                format!("CPU Core #{}", idx + 1),
                (mhz > 0).then_some(mhz as f64),
            ));
        }
        Ok(readings)
    }
}

struct MemoryDevice {
    system: System,
}

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

impl MemoryDevice {
    fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Device for MemoryDevice {
    fn identifier(&self) -> &str {
        "/ram"
    }

    fn update(&mut self) -> Result<()> {
        self.system.refresh_memory();
        Ok(())
    }

    fn sensors(&self) -> Result<Vec<SensorReading>> {
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let available = self.system.available_memory();

        let load = if total > 0 {
            Some(used as f64 / total as f64 * 100.0)
        } else {
            None
        };

        Ok(vec![
            SensorReading::new("/ram/load/0", "Memory", load),
            SensorReading::new("/ram/data/0", "Used Memory", Some(used as f64 / BYTES_PER_GIB)),
            SensorReading::new(
                "/ram/data/1",
                "Available Memory",
                Some(available as f64 / BYTES_PER_GIB),
            ),
        ])
    }
}

struct DiskDevice {
    disks: Disks,
}

impl DiskDevice {
    fn new() -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
        }
    }

    fn is_empty(&self) -> bool {
        self.disks.list().is_empty()
    }
}

impl Device for DiskDevice {
    fn identifier(&self) -> &str {
        "/hdd"
    }

    fn update(&mut self) -> Result<()> {
        self.disks.refresh(true);
        Ok(())
    }

    fn sensors(&self) -> Result<Vec<SensorReading>> {
        Ok(self
            .disks
            .list()
            .iter()
            .enumerate()
            .map(|(idx, disk)| {
                SensorReading::new(
                    format!("/hdd/{idx}/load/0"),
                    "Used Space",
                    used_space_load(disk.total_space(), disk.available_space()),
                )
            })
            .collect())
    }
}

fn used_space_load(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

struct ThermalDevice {
    components: Components,
}

impl ThermalDevice {
    fn new() -> Self {
        Self {
            components: Components::new_with_refreshed_list(),
        }
    }

    fn is_empty(&self) -> bool {
        self.components.list().is_empty()
    }
}

impl Device for ThermalDevice {
    fn identifier(&self) -> &str {
        "/thermal"
    }

    fn update(&mut self) -> Result<()> {
        for component in self.components.list_mut() {
            component.refresh();
        }
        Ok(())
    }

    fn sensors(&self) -> Result<Vec<SensorReading>> {
        Ok(thermal_readings(
            self.components
                .list()
                .iter()
                .map(|component| (component.label(), component.temperature())),
        ))
    }
}

// Labels repeat across identical parts (two NVMe drives, several ACPI zones),
// so each component gets its own series.
fn thermal_readings<'a>(
    components: impl Iterator<Item = (&'a str, Option<f32>)>,
) -> Vec<SensorReading> {
    components
        .enumerate()
        .map(|(idx, (label, celsius))| {
            SensorReading::new(
                format!("/thermal/{idx}/temperature/0"),
                label,
                celsius.and_then(finite),
            )
        })
        .collect()
}

fn finite(value: f32) -> Option<f64> {
    if value.is_finite() {
        Some(value as f64)
    } else {
        None
    }
}
