//! Entry point for the cluster-wide XMPP presence resolver.
//!
//! This binary is deliberately thin: load configuration, wire up the
//! collaborators the resolver core needs (a [`StaticKeyring`] and
//! [`NullPresenceStorage`] for now — see `DESIGN.md`), construct the
//! resolver exactly once, and hand it to the transport loop.

use std::sync::Arc;

use clap::Parser;
use resolver_xmpp::{IdentityTranslator, NullPresenceStorage, Resolver, StaticKeyring};
use tracing::info;

mod config;
mod telemetry;
mod transport;

use config::{CliArgs, Config};
use transport::ComponentOutbound;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    telemetry::init().map_err(|err| anyhow::anyhow!("failed to init telemetry: {err}"))?;

    let config = Config::load(&args)?;
    info!(network = %config.network, servername = %config.servername, "resolver starting");
    info!(version = env!("CARGO_PKG_VERSION"));

    let identity = IdentityTranslator::new(config.network.clone(), config.servername.clone());
    let keyring = Arc::new(StaticKeyring::new(config.peers.clone()));
    let storage = Arc::new(NullPresenceStorage);
    let outbound = Arc::new(ComponentOutbound::new());

    let resolver = Resolver::new(identity, keyring, storage, outbound.clone());

    let result = transport::run(&config, resolver, &outbound).await;

    telemetry::shutdown();
    result
}
