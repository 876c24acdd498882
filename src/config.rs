//! Bridge configuration.
//!
//! The bridge is constructed from a JSON configuration string describing the
//! chip, the debug unit options and the SoC topology. Optional register
//! bases are real options here; a `-1` sentinel in the input is a parse
//! error, not a magic value.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration describes no core (neither soc.fc nor soc.cluster present)")]
    NoCores,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chip: ChipConfig,
    #[serde(default)]
    pub adv_dbg_unit: AdvDbgConfig,
    pub soc: SocConfig,
    #[serde(default)]
    pub gdb_server: GdbConfig,
    #[serde(default)]
    pub reqserver: Option<ReqServerConfig>,
    #[serde(rename = "loop", default)]
    pub loops: LoopConfig,
    #[serde(default)]
    pub cable: CableConfig,
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(s)?;
        if config.soc.fc.is_none() && config.soc.cluster.is_none() {
            return Err(ConfigError::NoCores);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChipConfig {
    pub name: String,
    /// Value reported for a MISA CSR read. The debug unit cannot produce it,
    /// so the bridge answers with this constant.
    #[serde(default = "default_misa")]
    pub misa: u32,
}

fn default_misa() -> u32 {
    0x0400_0000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvDbgConfig {
    /// IR value selecting the debug module on the chosen tap.
    #[serde(default = "default_debug_ir")]
    pub debug_ir: u8,
    /// How many times a failed access is retried from scratch when error
    /// checking is enabled.
    #[serde(default)]
    pub retry_count: u32,
    /// Poll the AXI error register after every access.
    #[serde(default)]
    pub check_errors: bool,
    /// How long to wait for the AXI module to produce a read start bit.
    #[serde(default = "default_access_timeout")]
    pub access_timeout_us: u64,
}

fn default_debug_ir() -> u8 {
    0x4
}

fn default_access_timeout() -> u64 {
    1_000_000
}

impl Default for AdvDbgConfig {
    fn default() -> Self {
        AdvDbgConfig {
            debug_ir: default_debug_ir(),
            retry_count: 0,
            check_errors: false,
            access_timeout_us: default_access_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocConfig {
    #[serde(default)]
    pub fc: Option<FcConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

/// Single-core fabric controller.
#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    pub cluster_id: u32,
    pub dbg_unit_base: u32,
    #[serde(default)]
    pub icache_base: Option<u32>,
}

/// Multi-core cluster array with a cross-trigger matrix per cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_nb_cluster")]
    pub nb_cluster: u32,
    pub nb_pe: u32,
    #[serde(default = "default_cluster_base")]
    pub base: u32,
    #[serde(default)]
    pub power_bypass: Option<PowerBypassConfig>,
}

fn default_nb_cluster() -> u32 {
    1
}

fn default_cluster_base() -> u32 {
    0x1000_0000
}

/// Location of the "cluster is powered" bit in the SoC controller.
#[derive(Debug, Clone, Deserialize)]
pub struct PowerBypassConfig {
    pub reg_addr: u32,
    pub bit: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GdbConfig {
    #[serde(default = "default_gdb_port")]
    pub port: u16,
    /// Extra capabilities appended to the `qSupported` reply.
    #[serde(default)]
    pub capabilities: String,
}

fn default_gdb_port() -> u16 {
    3333
}

impl Default for GdbConfig {
    fn default() -> Self {
        GdbConfig {
            port: default_gdb_port(),
            capabilities: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReqServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    /// Well-known address holding the pointer to the target-side debug
    /// structure. Zero means "not provided"; the loop manager keeps polling
    /// until the pointer itself is non-null.
    #[serde(default)]
    pub debug_struct_addr: u32,
    #[serde(default = "default_fast_usecs")]
    pub fast_usecs: u64,
    #[serde(default = "default_slow_usecs")]
    pub slow_usecs: u64,
    /// Also require the target-state word of the debug structure to be
    /// non-zero before running loopers.
    #[serde(default)]
    pub check_available: bool,
}

fn default_fast_usecs() -> u64 {
    500
}

fn default_slow_usecs() -> u64 {
    10_000_000
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            debug_struct_addr: 0,
            fast_usecs: default_fast_usecs(),
            slow_usecs: default_slow_usecs(),
            check_available: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CableConfig {
    #[serde(rename = "type", default = "default_cable_type")]
    pub kind: String,
    #[serde(default = "default_cable_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Which device of the scanned chain carries the debug unit.
    #[serde(default)]
    pub tap: usize,
}

fn default_cable_type() -> String {
    "jtag-proxy".to_owned()
}

fn default_cable_host() -> String {
    "localhost".to_owned()
}

impl Default for CableConfig {
    fn default() -> Self {
        CableConfig {
            kind: default_cable_type(),
            host: default_cable_host(),
            port: 0,
            tap: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_fc_config() {
        let config = Config::from_json(
            r#"{
                "chip": { "name": "gap" },
                "soc": { "fc": { "cluster_id": 32, "dbg_unit_base": 456130560 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.chip.misa, 0x0400_0000);
        assert_eq!(config.adv_dbg_unit.debug_ir, 0x4);
        assert_eq!(config.gdb_server.port, 3333);
        let fc = config.soc.fc.unwrap();
        assert_eq!(fc.dbg_unit_base, 0x1B30_0000);
        assert!(fc.icache_base.is_none());
    }

    #[test]
    fn rejects_empty_soc() {
        let err = Config::from_json(r#"{ "chip": { "name": "gap" }, "soc": {} }"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoCores));
    }

    #[test]
    fn cluster_defaults() {
        let config = Config::from_json(
            r#"{
                "chip": { "name": "gap" },
                "soc": { "cluster": { "nb_pe": 8 } }
            }"#,
        )
        .unwrap();
        let cluster = config.soc.cluster.unwrap();
        assert_eq!(cluster.nb_cluster, 1);
        assert_eq!(cluster.base, 0x1000_0000);
        assert!(cluster.power_bypass.is_none());
    }
}
