// src/config.rs
//
// Persisted adapter configuration: `dirs::config_dir()` for the base
// directory, `serde_json` for the file format, silent fallback to defaults
// on any load error.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tlog;

/// Accepted CAN bitrates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CanBitrate {
    B25k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1000k,
}

impl CanBitrate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            CanBitrate::B25k => 25_000,
            CanBitrate::B50k => 50_000,
            CanBitrate::B100k => 100_000,
            CanBitrate::B125k => 125_000,
            CanBitrate::B250k => 250_000,
            CanBitrate::B500k => 500_000,
            CanBitrate::B800k => 800_000,
            CanBitrate::B1000k => 1_000_000,
        }
    }

    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Some(match bps {
            25_000 => CanBitrate::B25k,
            50_000 => CanBitrate::B50k,
            100_000 => CanBitrate::B100k,
            125_000 => CanBitrate::B125k,
            250_000 => CanBitrate::B250k,
            500_000 => CanBitrate::B500k,
            800_000 => CanBitrate::B800k,
            1_000_000 => CanBitrate::B1000k,
            _ => return None,
        })
    }
}

impl Default for CanBitrate {
    fn default() -> Self {
        CanBitrate::B500k
    }
}

fn default_socketcand_port() -> u16 {
    29536
}

fn default_beacon_port() -> u16 {
    default_socketcand_port()
}

fn default_status_bind() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)
}

fn default_hostname() -> String {
    "socketcand-bridge".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub can_bitrate: CanBitrate,
    #[serde(default)]
    pub cyphal_enabled: bool,
    #[serde(default)]
    pub cyphal_node_id: u8,
    #[serde(default = "default_socketcand_port")]
    pub socketcand_port: u16,
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    #[serde(default = "default_status_bind")]
    pub status_bind: SocketAddrV4,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            can_bitrate: CanBitrate::default(),
            cyphal_enabled: false,
            cyphal_node_id: 0,
            socketcand_port: default_socketcand_port(),
            beacon_port: default_beacon_port(),
            status_bind: default_status_bind(),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("socketcand-bridge").join("config.json"))
}

/// Loads the persisted config, falling back silently to defaults on any
/// I/O or parse error.
pub fn load_config() -> AdapterConfig {
    let Some(path) = config_path() else {
        tlog!("[config] no config directory available, using defaults");
        return AdapterConfig::default();
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tlog!("[config] failed to parse {}: {e}, using defaults", path.display());
                AdapterConfig::default()
            }
        },
        Err(_) => AdapterConfig::default(),
    }
}

/// Persists `config`, creating the config directory if needed.
pub fn save_config(config: &AdapterConfig) -> Result<(), String> {
    let path = config_path().ok_or_else(|| "no config directory available".to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }
    let content =
        serde_json::to_string_pretty(config).map_err(|e| format!("failed to serialize config: {e}"))?;
    std::fs::write(&path, content).map_err(|e| format!("failed to write config: {e}"))
}
