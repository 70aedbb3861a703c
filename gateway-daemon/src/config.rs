//! Startup configuration: CLI flags layered over an on-disk `gateway.toml`
//! (§4.11 of the spec), following the teacher's `daemon/src/config.rs`
//! split between a `confy`-managed file and `clap` flags that override it.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version, author, about = "Device gateway daemon")]
pub struct Opts {
    /// Verbosity level. -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory containing device definition JSON files.
    #[arg(long, env = "GATEWAY_DEFINITIONS")]
    pub definitions: Option<PathBuf>,

    /// HTTP/WebSocket bind address.
    #[arg(long, env = "GATEWAY_HTTP")]
    pub http: Option<String>,

    /// UDP bind port override (default 6272).
    #[arg(long, env = "GATEWAY_UDP_PORT")]
    pub udp_port: Option<u16>,
}

/// On-disk settings, loaded/saved with `confy` under the app's config
/// directory (`gateway.toml`). CLI flags in [`Opts`] override these at
/// startup but are not persisted back.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_bind_address: String,
    pub udp_bind_port: u16,
    pub definitions_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind_address: "0.0.0.0:6273".to_string(),
            udp_bind_port: gateway_core::transport::udp::UDP_BIND_PORT,
            definitions_dir: PathBuf::from("./definitions"),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Ok(confy::load("gateway-daemon", "gateway")?)
    }

    /// Applies CLI overrides on top of the loaded file config.
    pub fn merge(mut self, opts: &Opts) -> Self {
        if let Some(dir) = &opts.definitions {
            self.definitions_dir = dir.clone();
        }
        if let Some(http) = &opts.http {
            self.http_bind_address = http.clone();
        }
        if let Some(port) = opts.udp_port {
            self.udp_bind_port = port;
        }
        self
    }
}
