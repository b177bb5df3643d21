/*!
 * Engine configuration
 *
 * Plain serde-derived config types with defaults. The engine never loads
 * these from disk itself; embedding layers deserialize into them and pass
 * them down.
 */

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the capture engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shared-memory region name used by the transport.
    pub region_name: String,
    /// Whether frames are forwarded to the shared-memory transport.
    pub enable_transport: bool,
    pub transport: TransportConfig,
    pub monitor: MonitorConfig,
    pub error_log: ErrorLogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_name: "UndownUnlockFrameData".to_string(),
            enable_transport: true,
            transport: TransportConfig::default(),
            monitor: MonitorConfig::default(),
            error_log: ErrorLogConfig::default(),
        }
    }
}

/// Configuration for the shared-memory ring transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Total region size in bytes.
    pub region_size: usize,
    /// Number of ring slots.
    pub max_frames: u32,
    /// Payload capacity of one slot, excluding the slot header.
    pub slot_payload_size: u32,
}

impl TransportConfig {
    /// Slot capacity sized for one uncompressed frame of the given dimensions
    /// at 4 bytes per pixel.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        Self {
            slot_payload_size: width * height * 4,
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            region_size: 64 * 1024 * 1024,
            max_frames: 4,
            slot_payload_size: 1920 * 1080 * 4,
        }
    }
}

/// Configuration for the performance monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How many completed operation records are retained.
    pub max_completed_operations: usize,
    /// Default slow-operation threshold applied when no per-name
    /// threshold has been set.
    #[serde(with = "duration_ms")]
    pub default_slow_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_completed_operations: 1024,
            default_slow_threshold: Duration::from_millis(100),
        }
    }
}

/// Configuration for the in-memory error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogConfig {
    /// How many entries are retained before the oldest are dropped.
    pub max_entries: usize,
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

/// Configuration for the pooled allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size of the first OS region backing the pool.
    pub initial_region_size: usize,
    /// Ceiling on the total bytes of OS memory the pool may hold.
    pub max_pool_size: usize,
    /// Multiplier applied to the previous region size when growing.
    pub growth_factor: f64,
    /// Free regions idle longer than this are released by `cleanup`.
    #[serde(with = "duration_ms")]
    pub idle_cleanup: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_region_size: 1024 * 1024,
            max_pool_size: 100 * 1024 * 1024,
            growth_factor: 2.0,
            idle_cleanup: Duration::from_secs(30),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}
