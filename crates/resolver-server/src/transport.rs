//! The resolver's one transport: a persistent XMPP external-component
//! connection to the central router.
//!
//! This module is the concrete edge the design treats as an external
//! collaborator — the core never imports `tokio_xmpp` itself, it only ever
//! sees the [`resolver_xmpp::Outbound`] trait object this module implements.
//! Everything here is plumbing: connect, hand every inbound stanza to
//! [`Resolver::handle`](resolver_xmpp::Resolver::handle), and ship whatever
//! the resolver core hands back out over the same connection.
//!
//! The component connection can drop and get re-established at any time; the
//! [`Resolver`] itself (and the state it owns — presence cache, subscription
//! registry, in-flight lookups) is constructed exactly once by the caller and
//! outlives any number of reconnects. [`ComponentOutbound`] is the seam that
//! makes that possible: it holds a replaceable sink behind a mutex, so a
//! reconnect only ever swaps what is plugged into it.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use minidom::Element;
use resolver_xmpp::{Outbound, Resolver, ResolverError, Stanza};
use tokio::sync::Mutex;
use tokio_xmpp::Component;
use tracing::{error, info, instrument, warn};

use crate::config::Config;

type Sink = SplitSink<Component, Element>;
type Stream = SplitStream<Component>;

/// [`Outbound`] backed by a live component connection. Constructed once and
/// handed to the [`Resolver`] at startup; [`run`] swaps a fresh [`Sink`] in
/// on every reconnect via [`ComponentOutbound::set_sink`].
pub struct ComponentOutbound {
    sink: Mutex<Option<Sink>>,
}

impl ComponentOutbound {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    async fn set_sink(&self, sink: Sink) {
        *self.sink.lock().await = Some(sink);
    }

    async fn clear_sink(&self) {
        *self.sink.lock().await = None;
    }
}

impl Default for ComponentOutbound {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Outbound for ComponentOutbound {
    #[instrument(skip(self, stanza))]
    async fn send(&self, stanza: Stanza) {
        let element = stanza.into_element();
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            warn!("dropping outbound stanza, no active router connection");
            return;
        };
        if let Err(err) = sink.send(element).await {
            error!(%err, "failed to send stanza to central router, dropping connection");
            *guard = None;
        }
    }
}

/// Connect to the central router as an XMPP external component and run the
/// dispatch loop forever (until the process is asked to shut down). Every
/// inbound stanza, in arrival order, is handed to `resolver.handle` before
/// the next one is read — this is what gives the design's "subscription
/// broadcast completes before the next stanza on the same stream" ordering
/// guarantee for free: there is exactly one reader.
pub async fn run(
    config: &Config,
    resolver: Resolver,
    outbound: &ComponentOutbound,
) -> anyhow::Result<()> {
    loop {
        info!(router = %config.router_addr, component = %config.network, "connecting to central router");
        match connect_once(config, &resolver, outbound).await {
            Ok(()) => info!("central router connection closed cleanly"),
            Err(err) => warn!(%err, "central router connection dropped, reconnecting"),
        }
        outbound.clear_sink().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn connect_once(
    config: &Config,
    resolver: &Resolver,
    outbound: &ComponentOutbound,
) -> anyhow::Result<()> {
    let component = Component::new(
        &config.network,
        &config.component_secret,
        &config.router_addr,
    )
    .await
    .map_err(|err| ResolverError::io(err.to_string()))?;
    let (sink, mut stream) = component.split();
    outbound.set_sink(sink).await;

    while let Some(result) = stream.next().await {
        match result {
            Ok(element) => dispatch(resolver, element).await,
            Err(err) => {
                let err = ResolverError::io(err.to_string());
                warn!(%err, "error reading from central router connection");
                break;
            }
        }
    }
    Ok(())
}

#[instrument(skip(resolver, element))]
async fn dispatch(resolver: &Resolver, element: Element) {
    resolver.handle(Stanza::new(element)).await;
}
