//! Scan configuration knobs.
//!
//! Defaults suit a discrete accelerator with a few hundred MiB to spare per
//! scan. Every knob can be overridden from the environment with
//! [`ScanConfig::from_env`]:
//!
//! | Variable | Field |
//! |---|---|
//! | `GPUSCAN_ENABLED` | `enable_device` (`0`/`off`/`false` disables offload) |
//! | `GPUSCAN_CHUNK_SIZE` | `chunk_bytes` |
//! | `GPUSCAN_CHUNK_ROWS` | `chunk_rows` |
//! | `GPUSCAN_MAX_INFLIGHT` | `max_inflight` |
//! | `GPUSCAN_ORDERED` | `ordered` |
//! | `GPUSCAN_RESULT_FORMAT` | `result_format` (`row` or `slot`) |
//! | `GPUSCAN_PERFMON` | `perfmon` |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::chunk::ChunkFormat;

pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;
pub const DEFAULT_CHUNK_ROWS: usize = 65_536;
pub const DEFAULT_MAX_INFLIGHT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Byte budget of one source chunk image.
    pub chunk_bytes: usize,
    /// Row budget of one source chunk.
    pub chunk_rows: usize,
    /// Upper bound on tasks holding device memory at once.
    pub max_inflight: usize,
    /// When false every chunk is evaluated row-at-a-time on the host.
    pub enable_device: bool,
    /// Drain results in chunk submission order instead of arrival order.
    ///
    /// Rows of a filtered chunk keep their source order. Rows of a chunk the
    /// device projected come back in the order the kernel wrote them, which
    /// on CUDA follows per-block slot reservation and may differ from source
    /// order within the chunk. Only the order of chunks is guaranteed then.
    pub ordered: bool,
    /// Layout of device projection output.
    pub result_format: ChunkFormat,
    /// Collect per-task device timings.
    pub perfmon: bool,
    /// How long `advance()` waits on the completion latch per round.
    pub poll_interval: Duration,
    /// Destination regrowths allowed for one chunk before giving up.
    pub max_nospace_retries: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            enable_device: true,
            ordered: true,
            result_format: ChunkFormat::Row,
            perfmon: false,
            poll_interval: Duration::from_millis(2),
            max_nospace_retries: 6,
        }
    }
}

impl ScanConfig {
    /// Defaults overridden by any `GPUSCAN_*` variables that are set.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_env_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var::<Flag>(&get, "GPUSCAN_ENABLED") {
            self.enable_device = v.0;
        }
        if let Some(v) = parse_var::<usize>(&get, "GPUSCAN_CHUNK_SIZE") {
            self.chunk_bytes = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "GPUSCAN_CHUNK_ROWS") {
            self.chunk_rows = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "GPUSCAN_MAX_INFLIGHT") {
            self.max_inflight = v;
        }
        if let Some(v) = parse_var::<Flag>(&get, "GPUSCAN_ORDERED") {
            self.ordered = v.0;
        }
        if let Some(v) = parse_var::<ChunkFormat>(&get, "GPUSCAN_RESULT_FORMAT") {
            self.result_format = v;
        }
        if let Some(v) = parse_var::<Flag>(&get, "GPUSCAN_PERFMON") {
            self.perfmon = v.0;
        }
        self.normalized()
    }

    /// Clamp budgets so a scan can always make progress.
    pub fn normalized(mut self) -> Self {
        self.chunk_rows = self.chunk_rows.max(1);
        self.chunk_bytes = self.chunk_bytes.max(crate::chunk::MIN_CHUNK_BYTES);
        self.max_inflight = self.max_inflight.max(1);
        self
    }

    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes;
        self.normalized()
    }

    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows;
        self.normalized()
    }

    pub fn with_max_inflight(mut self, k: usize) -> Self {
        self.max_inflight = k;
        self.normalized()
    }

    pub fn with_device(mut self, enable: bool) -> Self {
        self.enable_device = enable;
        self
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_result_format(mut self, format: ChunkFormat) -> Self {
        self.result_format = format;
        self
    }

    pub fn with_perfmon(mut self, on: bool) -> Self {
        self.perfmon = on;
        self
    }
}

struct Flag(bool);

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" | "yes" => Ok(Flag(true)),
            "0" | "off" | "false" | "no" => Ok(Flag(false)),
            _ => Err(()),
        }
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target: "gpuscan", "ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn overrides_apply() {
        let cfg = ScanConfig::default().with_env_overrides(env(&[
            ("GPUSCAN_ENABLED", "off"),
            ("GPUSCAN_CHUNK_ROWS", "128"),
            ("GPUSCAN_MAX_INFLIGHT", "2"),
            ("GPUSCAN_RESULT_FORMAT", "slot"),
        ]));
        assert!(!cfg.enable_device);
        assert_eq!(cfg.chunk_rows, 128);
        assert_eq!(cfg.max_inflight, 2);
        assert_eq!(cfg.result_format, ChunkFormat::Slot);
    }

    #[test]
    fn bad_values_are_ignored() {
        let cfg = ScanConfig::default()
            .with_env_overrides(env(&[("GPUSCAN_CHUNK_ROWS", "lots"), ("GPUSCAN_ORDERED", "maybe")]));
        assert_eq!(cfg.chunk_rows, DEFAULT_CHUNK_ROWS);
        assert!(cfg.ordered);
    }

    #[test]
    fn zero_budgets_are_clamped() {
        let cfg = ScanConfig::default().with_chunk_rows(0).with_max_inflight(0);
        assert_eq!(cfg.chunk_rows, 1);
        assert_eq!(cfg.max_inflight, 1);
    }
}
