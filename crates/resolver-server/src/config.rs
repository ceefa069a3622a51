//! Typed configuration for the resolver binary.
//!
//! The core crate only needs an [`IdentityTranslator`](resolver_xmpp::IdentityTranslator)
//! and a peer hostlist; *where* those values come from is an external
//! collaborator concern (per the design's scope notes), but the shape of the
//! struct the core is constructed from is not. Values are layered default →
//! config file → `RESOLVER_`-prefixed environment variables, via the
//! `config` crate, with `clap` covering the handful of flags worth
//! overriding at the command line for a one-off run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Resolved configuration for one resolver process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The cluster's logical network domain (e.g. `kontalk.net`).
    pub network: String,
    /// This process's physical hostname (e.g. `prime.kontalk.net`).
    pub servername: String,
    /// Every peer host in the cluster, including `servername`. Backs the
    /// static `Keyring` collaborator.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Host:port of the central router's component-protocol listener.
    pub router_addr: String,
    /// Shared secret for the XMPP component handshake. Credential
    /// provisioning is an external collaborator concern; this is read
    /// verbatim from config/environment, never generated or validated here.
    #[serde(default)]
    pub component_secret: String,
}

impl Config {
    /// Load configuration from (in increasing priority): built-in defaults,
    /// an optional config file, and `RESOLVER_*` environment variables.
    pub fn load(args: &CliArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("peers", Vec::<String>::new())?
            .set_default("router_addr", "127.0.0.1:5347")?;

        if let Some(path) = args.config_file() {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RESOLVER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("peers")
                .try_parsing(true),
        );

        if let Some(network) = &args.network {
            builder = builder.set_override("network", network.clone())?;
        }
        if let Some(servername) = &args.servername {
            builder = builder.set_override("servername", servername.clone())?;
        }
        if !args.peers.is_empty() {
            builder = builder.set_override("peers", args.peers.clone())?;
        }
        if let Some(router_addr) = &args.router_addr {
            builder = builder.set_override("router_addr", router_addr.clone())?;
        }

        let config = builder.build().context("failed to assemble configuration")?;
        config
            .try_deserialize()
            .context("failed to parse configuration into Config")
    }
}

/// Command-line overrides for [`Config`]. Anything left unset here falls
/// through to the config file / environment / defaults.
#[derive(Debug, Parser)]
#[command(name = "resolver-server", about = "Cluster-wide XMPP presence resolver")]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long, env = "RESOLVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// The cluster's logical network domain.
    #[arg(long)]
    pub network: Option<String>,

    /// This process's physical hostname.
    #[arg(long)]
    pub servername: Option<String>,

    /// Peer hostnames in the cluster (repeatable).
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Host:port of the central router's component-protocol listener.
    #[arg(long)]
    pub router_addr: Option<String>,
}

impl CliArgs {
    fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(default_config_path)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("resolver").join("config.toml"))
}
