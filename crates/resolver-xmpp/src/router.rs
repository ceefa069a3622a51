//! Stanza Router: the resolver's single entry point.
//!
//! Every stanza the cluster hands the resolver enters through
//! [`Resolver::handle`]. From there it is classified, rewritten between
//! host- and network-scoped addressing, and either answered directly (from
//! the presence cache, for roster/last-activity/version queries, for
//! subscription bookkeeping) or fanned out across the cluster and answered
//! once the fan-out settles. Nothing here returns a value synchronously —
//! replies go out through the injected [`Outbound`] sink, the same way the
//! stanza that triggered them arrived. That keeps the deferred probe/IQ
//! fan-out (which can only resolve once peers answer or time out) and the
//! immediate cases (errors, cached answers) symmetric.
//!
//! Dispatch order inside a single stanza kind matters in a couple of spots
//! — a presence-available both updates the cache and persists to storage
//! before fanning out to subscribers, a last-activity query tries the
//! local cache before falling back to a cluster-wide peer fan-out — and
//! that ordering is called out inline rather than modeled as a generic
//! priority list, since there's no dynamic registration of handlers here
//! the way there was in the source.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{instrument, warn};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::collaborators::{Keyring, PresenceStorage};
use crate::identity::IdentityTranslator;
use crate::lookup::{fanout_deadline, LookupEngine};
use crate::metrics;
use crate::presence::PresenceCache;
use crate::stanza::{Kind, Stanza, NS_IQ_LAST, NS_IQ_ROSTER, NS_IQ_VERSION, NS_SERVER_RECEIPTS};
use crate::subscription::SubscriptionRegistry;

/// The resolver's own `iq:version` identity, reported for network-targeted
/// queries.
const VERSION_NAME: &str = "Resolver";
const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Where a processed stanza goes next. Implemented by whatever owns the
/// real socket — the resolver core never touches a transport directly.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, stanza: Stanza);
}

/// The resolver's wiring: identity translation, the presence cache, the
/// subscription registry, the lookup engine, and its two collaborators.
#[derive(Clone)]
pub struct Resolver {
    identity: IdentityTranslator,
    cache: PresenceCache,
    subs: SubscriptionRegistry,
    lookup: LookupEngine,
    keyring: Arc<dyn Keyring>,
    storage: Arc<dyn PresenceStorage>,
    outbound: Arc<dyn Outbound>,
    started_at: Instant,
}

impl Resolver {
    pub fn new(
        identity: IdentityTranslator,
        keyring: Arc<dyn Keyring>,
        storage: Arc<dyn PresenceStorage>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            identity,
            cache: PresenceCache::new(),
            subs: SubscriptionRegistry::new(),
            lookup: LookupEngine::new(),
            keyring,
            storage,
            outbound,
            started_at: Instant::now(),
        }
    }

    pub fn cache(&self) -> &PresenceCache {
        &self.cache
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subs
    }

    /// Entry point: classify and dispatch one incoming stanza.
    #[instrument(skip(self, stanza), fields(kind = ?stanza.kind()))]
    pub async fn handle(&self, mut stanza: Stanza) {
        if stanza.is_consumed() {
            return;
        }
        stanza.stash_original_to();

        // Chain replies from a `locate()` fan-out can arrive as ordinary
        // presence stanzas (the success path) or as a routing error (a
        // peer doesn't know the target at all); both need to reach the
        // lookup engine before the normal presence handlers see them.
        let kind_label = stanza.kind().label();

        if matches!(
            stanza.kind(),
            Kind::PresenceAvailable | Kind::PresenceUnavailable
        ) {
            if let Some((cid, count)) = stanza.group() {
                metrics::record_routed(kind_label, "chain_reply");
                self.lookup.resolve_chain(&cid, stanza, count);
                return;
            }
        }
        if stanza.kind() == Kind::PresenceError {
            if let Some(id) = stanza.id() {
                self.lookup.resolve_probe_error(id);
            }
            metrics::record_routed(kind_label, "probe_error");
            return;
        }

        metrics::record_routed(kind_label, "dispatched");
        match stanza.kind() {
            Kind::PresenceAvailable => self.on_presence_available(stanza).await,
            Kind::PresenceUnavailable => self.on_presence_unavailable(stanza).await,
            Kind::PresenceProbe => self.on_presence_probe(stanza).await,
            Kind::PresenceSubscribe => self.on_subscribe(stanza).await,
            Kind::PresenceUnsubscribe => self.on_unsubscribe(stanza).await,
            Kind::PresenceSubscribed | Kind::PresenceOther => self.forward(stanza).await,
            // Always handled by the early return above.
            Kind::PresenceError => {}
            Kind::IqGet | Kind::IqSet => self.on_iq(stanza).await,
            Kind::IqResult | Kind::IqError => self.on_iq_response(stanza).await,
            Kind::Message => self.on_message(stanza).await,
            Kind::Other => {
                warn!("stanza of unrecognized shape dropped");
            }
        }
    }

    async fn on_presence_available(&self, stanza: Stanza) {
        let Some(Jid::Full(from)) = stanza.from_jid() else {
            return;
        };
        let from = self.network_full(&from);
        let mut networked = stanza.clone_unconsumed();
        networked.set_from(&Jid::Full(from.clone()));
        self.cache.observe_available(&from, networked.clone_unconsumed());
        metrics::presence_cache_size().record(self.cache.len() as i64, &[]);

        // Only persist last-activity for this process's own local users —
        // presence for peer-hosted users already has a home in their own
        // process's storage.
        if from.domain().to_string() == self.identity.servername() && stanza.delay_stamp().is_none()
        {
            let bare = from.to_bare();
            self.storage.presence(&bare, networked.status_text()).await;
        }

        let replies = self.subs.broadcast(&from.to_bare(), &networked);
        for reply in replies {
            self.outbound.send(reply).await;
        }
    }

    async fn on_presence_unavailable(&self, stanza: Stanza) {
        let Some(Jid::Full(from)) = stanza.from_jid() else {
            return;
        };
        let net_from = self.network_full(&from);
        self.cache.observe_unavailable(&net_from);
        metrics::presence_cache_size().record(self.cache.len() as i64, &[]);

        self.subs.cancel_all(&net_from);
        metrics::subscription_registry_size().record(self.subs.len() as i64, &[]);

        let mut networked = stanza.clone_unconsumed();
        networked.set_from(&Jid::Full(net_from.clone()));
        let replies = self.subs.broadcast(&net_from.to_bare(), &networked);
        for reply in replies {
            self.outbound.send(reply).await;
        }

        // Only persist last-activity for this process's own local users —
        // presence for peer-hosted users already has a home in their own
        // process's storage.
        if from.domain().to_string() == self.identity.servername() && stanza.delay_stamp().is_none() {
            let bare = net_from.to_bare();
            match stanza.status_text() {
                Some(status) => self.storage.presence(&bare, Some(status)).await,
                None => self.storage.touch(&bare).await,
            }
        }
    }

    /// Answer a presence probe from the local cache, or `item-not-found` if
    /// this process has never observed the target. There is no cluster
    /// fan-out here — a probe is answered from exactly the data this
    /// process already has, same as [`Self::on_iq`]'s roster handler.
    async fn on_presence_probe(&self, stanza: Stanza) {
        let (Some(requester), Some(target)) = (stanza.from_jid(), stanza.to_jid()) else {
            return;
        };
        let target_bare = self.network_bare(&target.to_bare());

        match self.cache.lookup(&target_bare) {
            Some(stub) if stub.is_available() => {
                for presence in stub.presences() {
                    let mut reply = presence.clone_unconsumed();
                    reply.set_to(&requester);
                    self.outbound.send(reply).await;
                }
            }
            Some(_) => {
                let mut unavailable =
                    Element::builder("presence", "jabber:component:accept")
                        .attr("type", "unavailable")
                        .build();
                unavailable.set_attr("from", target_bare.to_string());
                unavailable.set_attr("to", requester.to_string());
                self.outbound.send(Stanza::new(unavailable)).await;
            }
            None => {
                self.send_error(&stanza, DefinedCondition::ItemNotFound).await;
            }
        }
    }

    /// The standalone cluster-wide "where is this user" capability
    /// described for the lookup engine: one presence probe per peer host,
    /// each tracked independently, merged through the tie-break rule once
    /// every probe has settled or timed out. Nothing in this router wires
    /// it to an inbound stanza — the local cache already answers every
    /// probe this process receives — but it is fully implemented and
    /// reachable for callers that need an authoritative cluster-wide
    /// answer (for instance a future admin/API surface).
    pub async fn locate(&self, target: Jid) -> Vec<Stanza> {
        let hosts = self.keyring.hostlist().await;
        let own = self.identity.servername();
        let peers: Vec<&String> = hosts.iter().filter(|h| h.as_str() != own).collect();
        if peers.is_empty() {
            return Vec::new();
        }
        let deadline = fanout_deadline(peers.len());
        metrics::record_lookup_started("probe");
        let started = Instant::now();

        let mut handles = Vec::with_capacity(peers.len());
        for host in &peers {
            let (cid, handle) = self.lookup.begin_probe(deadline);
            let mut probe = Element::builder("presence", "jabber:component:accept")
                .attr("type", "probe")
                .attr("id", cid.clone())
                .build();
            probe.set_attr("from", self.identity.network().to_string());
            probe.set_attr("to", retarget_host(&target, host).to_string());
            self.outbound.send(Stanza::new(probe)).await;
            handles.push(handle);
        }

        let batches = join_all(handles.into_iter().map(|h| h.collect())).await;
        let flattened: Vec<Stanza> = batches.into_iter().flatten().collect();
        metrics::record_lookup_completed(
            "probe",
            "collected",
            started.elapsed().as_secs_f64() * 1000.0,
        );
        crate::presence::merge_batch(flattened)
    }

    async fn on_subscribe(&self, stanza: Stanza) {
        let (Some(Jid::Full(watcher)), Some(target)) = (stanza.from_jid(), stanza.to_jid()) else {
            return;
        };
        let watched = self.network_bare(&target.to_bare());
        let watcher = self.network_full(&watcher);
        self.subs.subscribe(&watched, watcher.clone());
        metrics::subscription_registry_size().record(self.subs.len() as i64, &[]);
        let subscribed = SubscriptionRegistry::subscribed_presence(&watched, &watcher);
        self.forward(subscribed).await;
    }

    async fn on_unsubscribe(&self, stanza: Stanza) {
        let (Some(Jid::Full(watcher)), Some(target)) = (stanza.from_jid(), stanza.to_jid()) else {
            return;
        };
        let watched = self.network_bare(&target.to_bare());
        let watcher = self.network_full(&watcher);
        self.subs.unsubscribe(&watched, &watcher);
        metrics::subscription_registry_size().record(self.subs.len() as i64, &[]);
    }

    async fn on_iq(&self, stanza: Stanza) {
        let Some(ns) = stanza.query_namespace() else {
            self.forward(stanza).await;
            return;
        };
        match ns.as_str() {
            NS_IQ_ROSTER => self.on_roster_iq(stanza).await,
            NS_IQ_LAST => self.on_last_activity_iq(stanza).await,
            NS_IQ_VERSION => self.on_version_iq(stanza).await,
            _ => self.send_error(&stanza, DefinedCondition::ServiceUnavailable).await,
        }
    }

    /// Resolve every requested roster item via the cache and answer with a
    /// `result` roster. For each resolved item that is currently online,
    /// also synthesize and emit a presence-probe chain back to the
    /// requester — equivalent to the requester having probed that item
    /// directly — so a client populating its roster gets presence for
    /// every contact in the same round trip.
    async fn on_roster_iq(&self, stanza: Stanza) {
        let Some(requester) = stanza.from_jid() else {
            return;
        };
        let items = stanza.roster_items();
        let mut query = Element::builder("query", NS_IQ_ROSTER).build();
        let mut online_items = Vec::new();
        for item in &items {
            let bare = self.network_bare(&item.to_bare());
            let stub = self.cache.lookup(&bare);
            let online = stub.as_ref().is_some_and(|s| s.is_available());
            let sub = if online { "both" } else { "none" };
            let el = Element::builder("item", NS_IQ_ROSTER)
                .attr("jid", bare.to_string())
                .attr("subscription", sub)
                .build();
            query.append_child(el);
            if let Some(stub) = stub.filter(|_| online) {
                online_items.push((bare, stub));
            }
        }
        let mut result = Element::builder("iq", "jabber:component:accept")
            .attr("type", "result")
            .append(query)
            .build();
        if let Some(id) = stanza.id() {
            result.set_attr("id", id);
        }
        result.set_attr("to", requester.to_string());
        self.outbound.send(Stanza::new(result)).await;

        for (bare, stub) in online_items {
            let cid = crate::stanza::new_correlation_id();
            let presences: Vec<&crate::stanza::Stanza> = stub.presences().collect();
            let total = presences.len() as u32;
            for (i, presence) in presences.into_iter().enumerate() {
                let mut chained = presence.clone_unconsumed();
                chained.set_from(&Jid::Bare(bare.clone()));
                chained.set_to(&requester);
                chained.set_group(&cid, total - i as u32);
                self.outbound.send(chained).await;
            }
        }
    }

    /// Answer `jabber:iq:last`. A network-targeted query (no local part, or
    /// the network domain itself) answers with this process's own uptime.
    /// A user-targeted query answers immediately if the user is online
    /// locally (`seconds=0`); otherwise it fans the same `iq`, under its
    /// own `id`, out to every peer host and replies with whichever answer
    /// reports the smallest `seconds`. If there are no peers, or none
    /// reply before the deadline, the query bounces with `item-not-found`.
    async fn on_last_activity_iq(&self, stanza: Stanza) {
        let (Some(requester), Some(target)) = (stanza.from_jid(), stanza.to_jid()) else {
            return;
        };
        let target_bare = target.to_bare();
        if target_bare.node().is_none() && self.identity.is_network_scoped(&target) {
            self.reply_last_activity(&stanza, &requester, self.started_at.elapsed().as_secs(), None)
                .await;
            return;
        }

        let bare = self.network_bare(&target_bare);
        if self.cache.lookup(&bare).is_some_and(|s| s.is_available()) {
            self.reply_last_activity(&stanza, &requester, 0, None).await;
            return;
        }

        let hosts = self.keyring.hostlist().await;
        let own = self.identity.servername().to_string();
        let peers: Vec<String> = hosts.into_iter().filter(|h| *h != own).collect();

        if peers.is_empty() {
            self.send_error(&stanza, DefinedCondition::ItemNotFound).await;
            return;
        }

        let cid = stanza.id().unwrap_or_default().to_string();
        metrics::record_lookup_started("last_activity");
        let started = Instant::now();
        let handle = self.lookup.begin_activity(cid.clone(), peers.len());
        for host in &peers {
            let mut query = Element::builder("query", NS_IQ_LAST).build();
            query.set_attr("seconds", "0");
            let mut iq = Element::builder("iq", "jabber:component:accept")
                .attr("type", "get")
                .attr("id", cid.clone())
                .append(query)
                .build();
            iq.set_attr("from", self.identity.network().to_string());
            iq.set_attr("to", retarget_host(&Jid::Bare(bare.clone()), host).to_string());
            self.outbound.send(Stanza::new(iq)).await;
        }

        let peer_answer = handle.collect().await;
        metrics::record_lookup_completed(
            "last_activity",
            if peer_answer.is_some() { "collected" } else { "timeout" },
            started.elapsed().as_secs_f64() * 1000.0,
        );

        match peer_answer {
            Some((_, seconds)) => {
                self.reply_last_activity(&stanza, &requester, seconds, None).await;
            }
            None => self.send_error(&stanza, DefinedCondition::ItemNotFound).await,
        }
    }

    async fn reply_last_activity(
        &self,
        original: &Stanza,
        requester: &Jid,
        seconds: u64,
        status: Option<String>,
    ) {
        let mut query = Element::builder("query", NS_IQ_LAST)
            .attr("seconds", seconds.to_string())
            .build();
        if let Some(text) = status {
            query.append_text_node(text);
        }
        let mut result = Element::builder("iq", "jabber:component:accept")
            .attr("type", "result")
            .append(query)
            .build();
        if let Some(id) = original.id() {
            result.set_attr("id", id);
        }
        result.set_attr("to", requester.to_string());
        self.outbound.send(Stanza::new(result)).await;
    }

    async fn on_version_iq(&self, stanza: Stanza) {
        let (Some(requester), Some(target)) = (stanza.from_jid(), stanza.to_jid()) else {
            self.forward(stanza).await;
            return;
        };
        if target.to_bare().node().is_some() || !self.identity.is_network_scoped(&target) {
            self.forward(stanza).await;
            return;
        }
        let mut name_el = Element::builder("name", NS_IQ_VERSION).build();
        name_el.append_text_node(VERSION_NAME);
        let mut version_el = Element::builder("version", NS_IQ_VERSION).build();
        version_el.append_text_node(VERSION_NUMBER);
        let query = Element::builder("query", NS_IQ_VERSION)
            .append(name_el)
            .append(version_el)
            .build();
        let mut result = Element::builder("iq", "jabber:component:accept")
            .attr("type", "result")
            .append(query)
            .build();
        if let Some(id) = stanza.id() {
            result.set_attr("id", id);
        }
        result.set_attr("to", requester.to_string());
        self.outbound.send(Stanza::new(result)).await;
    }

    /// Route a `result`/`error` IQ back to the lookup engine if its `id`
    /// matches a pending last-activity fan-out, otherwise forward it.
    async fn on_iq_response(&self, stanza: Stanza) {
        if let (Some(id), Some(from)) = (stanza.id(), stanza.from_jid()) {
            if stanza.kind() == Kind::IqResult {
                if let Some(seconds) = stanza.last_seconds() {
                    self.lookup
                        .resolve_activity(id, from.domain().to_string(), seconds);
                    return;
                }
            }
            // An error response to a shared-id last-activity query still
            // counts as a reply for completion purposes, just not a useful
            // one — treat it as "unknown", which never beats a real answer.
            if stanza.kind() == Kind::IqError {
                self.lookup
                    .resolve_activity(id, from.domain().to_string(), u64::MAX);
                return;
            }
        }
        self.forward(stanza).await;
    }

    /// Deliver a message per the network-scoped delivery rules: unknown
    /// recipients bounce with `item-not-found`, a bare recipient with
    /// online resources gets one copy forwarded per available resource, a
    /// bare recipient with none goes to this process's own host for
    /// store-and-forward, and a full recipient must match an online
    /// resource exactly or is silently dropped. A message that is itself a
    /// delivery receipt (`<received id=.../>`) and resolves to a peer host
    /// also gets a synthetic notice echoed back to this process's own host,
    /// so the client-to-server subsystem can purge its stored copy of the
    /// original message without waiting on the peer to relay anything back.
    async fn on_message(&self, mut stanza: Stanza) {
        let to = match stanza.to_jid() {
            Some(to) => to,
            None if stanza.element().attr("to").is_some() => {
                self.send_error(&stanza, DefinedCondition::JidMalformed).await;
                return;
            }
            None => {
                let Some(from) = stanza.from_jid() else {
                    self.forward(stanza).await;
                    return;
                };
                let bare = Jid::Bare(from.to_bare());
                stanza.set_to(&bare);
                bare
            }
        };
        if !self.identity.is_network_scoped(&to) {
            self.forward(stanza).await;
            return;
        }

        let net_to = self.network_bare_or_full(&to);
        match self.cache.cache_lookup(&net_to) {
            None => self.send_error(&stanza, DefinedCondition::ItemNotFound).await,
            Some(resources) if resources.is_empty() => match &net_to {
                // No resource matches a full-JID-addressed recipient: drop
                // silently, stanza stays consumed, no error sent.
                Jid::Full(_) => {}
                Jid::Bare(bare) => {
                    self.deliver_resolved(stanza, Jid::Bare(bare.clone())).await;
                }
            },
            Some(resources) => match &net_to {
                Jid::Full(full) => {
                    self.deliver_resolved(stanza, Jid::Full(full.clone())).await;
                }
                // Bare-addressed, resources available: one copy per online
                // resource, not just the first.
                Jid::Bare(_) => {
                    for resource in resources {
                        self.deliver_resolved(stanza.clone_unconsumed(), Jid::Full(resource))
                            .await;
                    }
                }
            },
        }
    }

    async fn deliver_resolved(&self, stanza: Stanza, target: Jid) {
        let host = target.domain().to_string();
        let dest_host = if host == self.identity.network() {
            self.identity.servername().to_string()
        } else {
            host
        };
        self.deliver_to_host(stanza, &target, &dest_host).await;
    }

    async fn deliver_to_host(&self, mut stanza: Stanza, target: &Jid, host: &str) {
        let receipt_id = stanza.receipt_id();
        let dest = retarget_host(target, host);
        stanza.set_to(&dest);
        self.outbound.send(stanza).await;

        if host != self.identity.servername() {
            if let Some(recvid) = receipt_id {
                let receipt = Element::builder("received", NS_SERVER_RECEIPTS)
                    .attr("id", recvid)
                    .build();
                let mut message = Element::builder("message", "jabber:component:accept")
                    .append(receipt)
                    .build();
                message.set_attr("from", self.identity.network().to_string());
                message.set_attr("to", self.identity.servername().to_string());
                self.outbound.send(Stanza::new(message)).await;
            }
        }
    }

    /// Deliver a stanza onward without further resolver-side processing,
    /// after translating its addressing across the network/host boundary.
    async fn forward(&self, mut stanza: Stanza) {
        if let Some(to) = stanza.to_jid() {
            if self.identity.is_network_scoped(&to) {
                stanza.set_to(&self.identity.translate_to_server(&to));
            }
        }
        self.outbound.send(stanza).await;
    }

    async fn send_error(&self, original: &Stanza, condition: DefinedCondition) {
        let error_type = match condition {
            DefinedCondition::JidMalformed => ErrorType::Modify,
            _ => ErrorType::Cancel,
        };
        self.outbound
            .send(error_response(original, condition, error_type))
            .await;
    }

    fn network_full(&self, full: &FullJid) -> FullJid {
        match self.identity.translate_to_network(&Jid::Full(full.clone())) {
            Jid::Full(f) => f,
            Jid::Bare(b) => b
                .with_resource_str(&full.resource().to_string())
                .unwrap_or_else(|_| full.clone()),
        }
    }

    fn network_bare(&self, bare: &BareJid) -> BareJid {
        match self.identity.translate_to_network(&Jid::Bare(bare.clone())) {
            Jid::Bare(b) => b,
            Jid::Full(f) => f.to_bare(),
        }
    }

    fn network_bare_or_full(&self, j: &Jid) -> Jid {
        self.identity.translate_to_network(j)
    }
}

fn error_response(original: &Stanza, condition: DefinedCondition, error_type: ErrorType) -> Stanza {
    let name = original.element().name().to_owned();
    let ns = original.element().ns();
    let mut el = Element::builder(name, ns).attr("type", "error").build();
    if let Some(id) = original.id() {
        el.set_attr("id", id);
    }
    if let Some(from) = original.to_jid() {
        el.set_attr("from", from.to_string());
    }
    if let Some(to) = original.from_jid() {
        el.set_attr("to", to.to_string());
    }
    let stanza_error = StanzaError::new(error_type, condition, "en", "");
    el.append_child(Element::from(stanza_error));
    Stanza::new(el)
}

fn retarget_host(target: &Jid, host: &str) -> Jid {
    match target {
        Jid::Bare(b) => match b.node() {
            Some(node) => format!("{node}@{host}").parse().unwrap_or_else(|_| target.clone()),
            None => host.parse().unwrap_or_else(|_| target.clone()),
        },
        Jid::Full(f) => match f.node() {
            Some(node) => format!("{node}@{host}/{}", f.resource())
                .parse()
                .unwrap_or_else(|_| target.clone()),
            None => format!("{host}/{}", f.resource())
                .parse()
                .unwrap_or_else(|_| target.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NullPresenceStorage, StaticKeyring};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Stanza>>,
    }

    #[async_trait]
    impl Outbound for Recording {
        async fn send(&self, stanza: Stanza) {
            self.sent.lock().unwrap().push(stanza);
        }
    }

    fn presence(from: &str, to: &str, ty: Option<&str>) -> Stanza {
        let mut b = Element::builder("presence", "jabber:component:accept")
            .attr("from", from)
            .attr("to", to);
        if let Some(t) = ty {
            b = b.attr("type", t);
        }
        Stanza::new(b.build())
    }

    fn message(from: &str, to: &str, id: &str) -> Stanza {
        let el = Element::builder("message", "jabber:component:accept")
            .attr("from", from)
            .attr("to", to)
            .attr("id", id)
            .build();
        Stanza::new(el)
    }

    #[derive(Default)]
    struct RecordingStorage {
        presences: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl crate::collaborators::PresenceStorage for RecordingStorage {
        async fn presence(&self, user: &BareJid, status: Option<String>) {
            self.presences.lock().unwrap().push((user.to_string(), status));
        }

        async fn touch(&self, _user: &BareJid) {}
    }

    fn test_resolver(outbound: Arc<Recording>) -> Resolver {
        Resolver::new(
            IdentityTranslator::new("kontalk.net", "prime.kontalk.net"),
            Arc::new(StaticKeyring::new(vec![
                "prime.kontalk.net".into(),
                "beta.kontalk.net".into(),
            ])),
            Arc::new(NullPresenceStorage),
            outbound,
        )
    }

    #[tokio::test]
    async fn presence_available_updates_cache_and_broadcasts() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .subscriptions()
            .subscribe(&"alice@kontalk.net".parse().unwrap(), "bob@kontalk.net/phone".parse().unwrap());

        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;

        assert!(resolver
            .cache()
            .is_available(&"alice@kontalk.net/desktop".parse().unwrap()));
        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("to"), Some("bob@kontalk.net"));
    }

    #[tokio::test]
    async fn subscribe_emits_synthetic_subscribed_presence() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence(
                "bob@prime.kontalk.net/phone",
                "alice@kontalk.net",
                Some("subscribe"),
            ))
            .await;

        assert_eq!(
            resolver.subscriptions().subscribers(&"alice@kontalk.net".parse().unwrap()).len(),
            1
        );
        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("subscribed"));
        assert_eq!(sent[0].element().attr("from"), Some("alice@kontalk.net"));
    }

    #[tokio::test]
    async fn probe_answers_from_cache_when_known() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(presence("carol@prime.kontalk.net/phone", "alice@kontalk.net", Some("probe")))
            .await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Kind::PresenceAvailable);
    }

    #[tokio::test]
    async fn probe_for_unknown_user_bounces_item_not_found() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());

        resolver
            .handle(presence("carol@prime.kontalk.net/phone", "ghost@kontalk.net", Some("probe")))
            .await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn message_to_unknown_bare_jid_bounces() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());

        resolver
            .handle(message("bob@prime.kontalk.net/phone", "ghost@kontalk.net", "msg1"))
            .await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn message_to_online_bare_jid_delivers_without_receipt_notice() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(message("bob@prime.kontalk.net/phone", "alice@kontalk.net", "msg1"))
            .await;

        // Not itself a delivery receipt, so no synthetic purge notice — just
        // the one delivered copy.
        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().name(), "message");
        assert_eq!(sent[0].element().attr("to"), Some("alice@prime.kontalk.net/desktop"));
    }

    fn receipt_message(from: &str, to: &str, receipt_id: &str) -> Stanza {
        let received = Element::builder("received", NS_SERVER_RECEIPTS)
            .attr("id", receipt_id)
            .build();
        let el = Element::builder("message", "jabber:component:accept")
            .attr("from", from)
            .attr("to", to)
            .append(received)
            .build();
        Stanza::new(el)
    }

    #[tokio::test]
    async fn receipt_message_to_peer_hosted_user_emits_purge_notice() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        // alice is online via the peer host beta.kontalk.net, not this
        // process's own servername.
        resolver
            .handle(presence("alice@beta.kontalk.net/phone", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(receipt_message(
                "bob@prime.kontalk.net/phone",
                "alice@kontalk.net",
                "recv1",
            ))
            .await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].element().name(), "message");
        // Delivered to alice's actual host, not this process's servername.
        assert_eq!(sent[0].element().attr("to"), Some("alice@beta.kontalk.net/phone"));
        assert_eq!(sent[1].element().attr("to"), Some("prime.kontalk.net"));
        let notice_receipt = sent[1]
            .element()
            .get_child("received", minidom::NSChoice::Any)
            .expect("purge notice carries the received child");
        assert_eq!(notice_receipt.attr("id"), Some("recv1"));
    }

    #[tokio::test]
    async fn receipt_message_to_locally_hosted_user_emits_no_purge_notice() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(receipt_message(
                "bob@prime.kontalk.net/phone",
                "alice@kontalk.net",
                "recv2",
            ))
            .await;

        // alice is hosted on this process's own servername: no purge notice
        // needed, just the one delivered copy.
        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("to"), Some("alice@prime.kontalk.net/desktop"));
    }

    #[tokio::test]
    async fn roster_iq_resolves_items_and_emits_presence_chain() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        let query = Element::builder("query", NS_IQ_ROSTER)
            .append(
                Element::builder("item", NS_IQ_ROSTER)
                    .attr("jid", "alice@kontalk.net")
                    .build(),
            )
            .build();
        let iq = Element::builder("iq", "jabber:component:accept")
            .attr("type", "get")
            .attr("id", "r1")
            .attr("from", "bob@prime.kontalk.net/phone")
            .append(query)
            .build();

        resolver.handle(Stanza::new(iq)).await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].element().name(), "iq");
        assert_eq!(sent[1].element().name(), "presence");
        assert_eq!(sent[1].element().attr("to"), Some("bob@prime.kontalk.net/phone"));
    }

    #[tokio::test]
    async fn message_with_unparsable_to_bounces_jid_malformed() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        let el = Element::builder("message", "jabber:component:accept")
            .attr("from", "bob@prime.kontalk.net/phone")
            .attr("to", "not a jid")
            .attr("id", "msg1")
            .build();

        resolver.handle(Stanza::new(el)).await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("error"));
        let err = sent[0]
            .element()
            .get_child("error", minidom::NSChoice::Any)
            .unwrap();
        assert_eq!(err.attr("type"), Some("modify"));
    }

    #[tokio::test]
    async fn message_with_no_to_defaults_to_sender_bare() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        let el = Element::builder("message", "jabber:component:accept")
            .attr("from", "bob@prime.kontalk.net/phone")
            .build();

        resolver.handle(Stanza::new(el)).await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // bob's bare is not network-scoped, so it just forwards unchanged.
        assert_eq!(sent[0].element().attr("to"), Some("bob@prime.kontalk.net"));
    }

    #[tokio::test]
    async fn iq_with_unrecognized_query_namespace_bounces_service_unavailable() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        let query = Element::builder("query", "jabber:iq:private").build();
        let iq = Element::builder("iq", "jabber:component:accept")
            .attr("type", "get")
            .attr("id", "p1")
            .attr("from", "bob@prime.kontalk.net/phone")
            .append(query)
            .build();

        resolver.handle(Stanza::new(iq)).await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("error"));
        let err = sent[0]
            .element()
            .get_child("error", minidom::NSChoice::Any)
            .unwrap();
        assert_eq!(err.attr("type"), Some("cancel"));
        assert!(err
            .get_child("service-unavailable", minidom::NSChoice::Any)
            .is_some());
    }

    #[tokio::test]
    async fn presence_available_from_local_user_persists_to_storage() {
        let out = Arc::new(Recording::default());
        let storage = Arc::new(RecordingStorage::default());
        let resolver = Resolver::new(
            IdentityTranslator::new("kontalk.net", "prime.kontalk.net"),
            Arc::new(StaticKeyring::new(vec!["prime.kontalk.net".into()])),
            storage.clone(),
            out,
        );

        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;

        let recorded = storage.presences.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "alice@kontalk.net");
    }

    #[tokio::test]
    async fn message_to_bare_jid_with_two_resources_delivers_to_both() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        resolver
            .handle(presence("alice@prime.kontalk.net/phone", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(message("bob@prime.kontalk.net/phone", "alice@kontalk.net", "msg1"))
            .await;

        let sent = out.sent.lock().unwrap();
        let delivered: Vec<&str> = sent
            .iter()
            .filter(|s| s.element().name() == "message")
            .filter_map(|s| s.element().attr("to"))
            .collect();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.contains(&"alice@prime.kontalk.net/desktop"));
        assert!(delivered.contains(&"alice@prime.kontalk.net/phone"));
    }

    #[tokio::test]
    async fn message_to_full_jid_with_no_matching_resource_is_dropped_silently() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        resolver
            .handle(presence("alice@prime.kontalk.net/desktop", "kontalk.net", None))
            .await;
        out.sent.lock().unwrap().clear();

        resolver
            .handle(message(
                "bob@prime.kontalk.net/phone",
                "alice@kontalk.net/tablet",
                "msg1",
            ))
            .await;

        assert!(out.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_activity_with_no_peers_bounces_item_not_found() {
        let out = Arc::new(Recording::default());
        let resolver = Resolver::new(
            IdentityTranslator::new("kontalk.net", "prime.kontalk.net"),
            Arc::new(StaticKeyring::new(vec!["prime.kontalk.net".into()])),
            Arc::new(NullPresenceStorage),
            out.clone(),
        );

        let query = Element::builder("query", NS_IQ_LAST).build();
        let iq = Element::builder("iq", "jabber:component:accept")
            .attr("type", "get")
            .attr("id", "q1")
            .attr("from", "bob@prime.kontalk.net/phone")
            .attr("to", "alice@kontalk.net")
            .append(query)
            .build();

        resolver.handle(Stanza::new(iq)).await;

        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].element().attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn already_consumed_stanza_is_ignored() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());
        let mut stanza = presence("alice@prime.kontalk.net/desktop", "kontalk.net", None);
        stanza.consume();

        resolver.handle(stanza).await;

        assert!(out.sent.lock().unwrap().is_empty());
        assert!(!resolver
            .cache()
            .is_available(&"alice@kontalk.net/desktop".parse().unwrap()));
    }

    #[tokio::test]
    async fn locate_probes_every_peer_and_collects_chain_replies() {
        let out = Arc::new(Recording::default());
        let resolver = test_resolver(out.clone());

        let target: Jid = "alice@kontalk.net".parse().unwrap();
        let r2 = resolver.clone();
        let handle = tokio::spawn(async move { r2.locate(target).await });

        // Give the fan-out a turn to register its pending probe and emit
        // the outbound probe before any peer replies.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let probes = out.sent.lock().unwrap().clone();
        // Only beta.kontalk.net is a peer; prime.kontalk.net is this
        // process's own servername and is excluded from the fan-out.
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].element().attr("type"), Some("probe"));
        assert_eq!(probes[0].element().attr("to"), Some("alice@beta.kontalk.net"));
        let cid = probes[0].id().unwrap().to_string();

        let el = Element::builder("presence", "jabber:component:accept")
            .attr("from", "alice@beta.kontalk.net/phone")
            .attr("to", "kontalk.net")
            .build();
        let mut reply = Stanza::new(el);
        reply.set_group(&cid, 1);
        resolver.handle(reply).await;

        let results = handle.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].element().attr("from"), Some("alice@beta.kontalk.net/phone"));
    }
}
