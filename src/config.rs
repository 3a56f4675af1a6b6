//! Configuration (§10, ambient): a `serde`/`toml`-deserialized config tree
//! plus a `clap` CLI wrapper that can override a couple of fields, mirroring
//! the config-struct-plus-CLI-override pattern used for the example pack's
//! own binaries.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::{GatewayError, Result};

#[derive(Parser, Debug)]
#[command(name = "bearerboxd", about = "SMS/WAP gateway routing core")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Overrides `core.store_path` from the config file.
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Overrides `core.admin_port` from the config file.
    #[arg(long)]
    pub admin_port: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoreConfig {
    pub store_path: PathBuf,
    #[serde(default = "default_dump_interval")]
    pub store_dump_interval: u64,
    #[serde(default)]
    pub max_incoming_sms_qlength: Option<usize>,
    pub smsbox_port: u16,
    #[serde(default)]
    pub wapbox_port: Option<u16>,
    pub admin_port: u16,
    #[serde(default)]
    pub unified_prefix: Option<String>,
    #[serde(default)]
    pub white_list: Vec<String>,
    #[serde(default)]
    pub black_list: Vec<String>,
    #[serde(default = "default_max_pending")]
    pub smsbox_max_pending: usize,
}

fn default_dump_interval() -> u64 {
    10
}

fn default_max_pending() -> usize {
    100
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fake,
    Smpp,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SmscConfig {
    pub id: String,
    pub backend: Backend,
    #[serde(default)]
    pub allowed_smsc_id: Option<String>,
    #[serde(default)]
    pub denied_smsc_id: Option<String>,
    #[serde(default)]
    pub preferred_smsc_id: Option<String>,
    #[serde(default)]
    pub allowed_prefix: Option<String>,
    #[serde(default)]
    pub denied_prefix: Option<String>,
    #[serde(default)]
    pub preferred_prefix: Option<String>,
    #[serde(default)]
    pub unified_prefix: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default)]
    pub throughput: Option<u32>,
    #[serde(default)]
    pub reroute: bool,
    #[serde(default)]
    pub reroute_to_smsc: Option<String>,
    #[serde(default)]
    pub reroute_by_receiver: Vec<(String, String)>,
    #[serde(default = "default_true")]
    pub reroute_dlr: bool,

    // smpp backend fields.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct BoxListenConfig {
    pub smsbox_port: u16,
    #[serde(default)]
    pub wapbox_port: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub core: CoreConfig,
    #[serde(default)]
    pub smsc: Vec<SmscConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        if config.smsc.is_empty() {
            return Err(GatewayError::Config("at least one [[smsc]] group is required".into()));
        }
        if config.core.store_path.as_os_str().is_empty() {
            return Err(GatewayError::Config("core.store_path must not be empty".into()));
        }
        Ok(config)
    }

    pub fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(store_path) = &cli.store_path {
            self.core.store_path = store_path.clone();
        }
        if let Some(admin_port) = cli.admin_port {
            self.core.admin_port = admin_port;
        }
    }
}
