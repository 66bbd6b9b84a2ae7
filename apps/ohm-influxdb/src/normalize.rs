use thiserror::Error;

/// Series/field pair a raw sensor maps onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricKey {
    pub series: String,
    pub field: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("sensor identifier {0:?} has no path separator")]
    MissingSeparator(String),
    #[error("sensor identifier {0:?} has an empty series path")]
    EmptySeries(String),
    #[error("sensor {0:?} has an empty name")]
    EmptyField(String),
}

/// Maps a hardware identifier such as `/nvidiagpu/0/load/0` and a display
/// name such as `GPU Core #2` onto `nvidiagpu.0.load` / `gpucore.2`.
///
/// The trailing identifier segment is the per-device sensor index and is
/// dropped so every sensor of the same kind lands in one series, one field per
/// sensor.
pub fn normalize(identifier: &str, name: &str) -> Result<MetricKey, NormalizeError> {
    let path = identifier.strip_prefix('/').unwrap_or(identifier);
    let (parent, _index) = path
        .rsplit_once('/')
        .ok_or_else(|| NormalizeError::MissingSeparator(identifier.to_string()))?;
    if parent.is_empty() {
        return Err(NormalizeError::EmptySeries(identifier.to_string()));
    }

    let series = parent.replace('/', ".");
    let field = normalize_field(name);
    if field.is_empty() {
        return Err(NormalizeError::EmptyField(identifier.to_string()));
    }

    Ok(MetricKey { series, field })
}

fn normalize_field(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .map(|c| if c == '#' { '.' } else { c })
        .collect()
}
