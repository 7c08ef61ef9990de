use std::time::Duration;

use pvgpu_protocol::command::INTERFACE_VERSION;
use pvgpu_protocol::{PageGeometry, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level configuration, loaded from pvgpu.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvgpuConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Upper bound on any request or reply, in bytes. Never above the protocol maximum.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// How long a loopback or diagnostic channel waits for a completion
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// log2 of the guest page size used by the sysmem page-list encoding
    #[serde(default = "default_page_shift")]
    pub page_shift: u32,
    /// Describe existing system memory to the host by its physical pages
    #[serde(default = "default_true")]
    pub map_guest_pages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Interface version offered when opening adapters
    #[serde(default = "default_interface_version")]
    pub interface_version: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_shift: default_page_shift(),
            map_guest_pages: true,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            interface_version: default_interface_version(),
        }
    }
}

impl PvgpuConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: PvgpuConfig =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.page_geometry()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Effective packet limit.
    pub fn max_packet_size(&self) -> usize {
        self.transport.max_packet_size.min(MAX_PACKET_SIZE)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.sync_timeout_ms)
    }

    pub fn page_geometry(&self) -> Result<PageGeometry, CoreError> {
        PageGeometry::new(self.memory.page_shift)
            .ok_or_else(|| CoreError::Config(format!("unsupported page_shift {}", self.memory.page_shift)))
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/pvgpu/pvgpu.toml`
/// 2. Local fallback: `./pvgpu.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/pvgpu/pvgpu.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "pvgpu.toml".to_string()
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_sync_timeout_ms() -> u64 {
    5000
}

fn default_page_shift() -> u32 {
    PageGeometry::X86_4K.shift()
}

fn default_interface_version() -> u32 {
    INTERFACE_VERSION
}

fn default_true() -> bool {
    true
}
