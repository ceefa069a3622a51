//! Lookup Engine: the fan-out/aggregate protocol for two distinct
//! cluster-wide questions.
//!
//! "Is this user online anywhere, and with what presence" sends one presence
//! probe *per peer host*, each tagged with its own correlation id, and
//! completes that probe the moment its chain finishes or it errors — the
//! outer lookup completes once every per-peer probe has settled.
//! "How long has this user been gone" sends the same `iq` (one shared
//! correlation id) to every peer and keeps the smallest `seconds` reply,
//! short-circuiting the moment any peer says `0` (the user is online
//! *there*).
//!
//! Both share the same bones: tag a request with a correlation id, track
//! how many replies are still outstanding, and resolve a future when either
//! enough replies are in or the deadline passes. [`PendingProbe`] and
//! [`PendingActivity`] are kept as separate tables because their completion
//! rules differ enough that unifying them would just be a `match` in
//! disguise.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::stanza::{new_correlation_id, Stanza};

/// Seconds to wait for a presence probe response from a peer server, before
/// scaling by cluster size. Named for the source constant this mirrors.
pub const MAX_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Multiplier applied on top of [`MAX_LOOKUP_TIMEOUT`] and the peer count
/// when computing a fan-out's deadline. The source exposes this as an
/// optional per-call argument defaulting to `1.0`; this crate fixes it as a
/// constant since nothing in the design calls for per-lookup tuning.
pub const WAIT_FACTOR: f64 = 1.0;

/// The deadline for a fan-out touching `peer_count` hosts:
/// `MAX_LOOKUP_TIMEOUT * WAIT_FACTOR * peer_count`.
pub fn fanout_deadline(peer_count: usize) -> Duration {
    MAX_LOOKUP_TIMEOUT.mul_f64(WAIT_FACTOR * peer_count.max(1) as f64)
}

struct PendingProbe {
    /// Total replies expected in the chain, learned from the first reply's
    /// `count` (a chain of `n` presences counts down from `n`). `None`
    /// until the first reply arrives.
    expected: Option<u32>,
    received: Vec<Stanza>,
    done: Option<oneshot::Sender<Vec<Stanza>>>,
}

struct PendingActivity {
    targets: usize,
    received: usize,
    latest: Option<(String, u64)>,
    done: Option<oneshot::Sender<Option<(String, u64)>>>,
}

/// Tracks in-flight correlation ids for both fan-out protocols and resolves
/// their futures as peers answer or as their deadlines pass.
#[derive(Clone, Default)]
pub struct LookupEngine {
    probes: Arc<DashMap<String, PendingProbe>>,
    activity: Arc<DashMap<String, PendingActivity>>,
}

impl LookupEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Presence probe chains -------------------------------------------

    /// Register a new per-peer probe. Returns the correlation id to stamp
    /// on the outgoing probe and a handle that resolves once the chain
    /// completes, an error reply arrives, or `deadline` passes.
    #[instrument(skip(self))]
    pub fn begin_probe(&self, deadline: Duration) -> (String, ProbeHandle) {
        let cid = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.probes.insert(
            cid.clone(),
            PendingProbe {
                expected: None,
                received: Vec::new(),
                done: Some(tx),
            },
        );
        debug!(correlation_id = %cid, "probe registered");
        (
            cid.clone(),
            ProbeHandle {
                rx,
                engine: self.clone(),
                cid,
                deadline,
            },
        )
    }

    /// Feed one element of a success chain in. `count` is the chain's
    /// `<group count=.../>` value for this reply: it counts down from the
    /// peer's total known presences to 1 for the peer's last one (or is `0`
    /// if the peer knows nothing). The probe completes once the buffer has
    /// collected as many replies as the first one announced, or
    /// immediately on a `count == 0` reply.
    #[instrument(skip(self, reply))]
    pub fn resolve_chain(&self, cid: &str, reply: Stanza, count: u32) {
        let Some(mut entry) = self.probes.get_mut(cid) else {
            debug!(correlation_id = %cid, "chain reply for unknown or expired probe");
            return;
        };
        if entry.expected.is_none() {
            entry.expected = Some(count.max(1));
        }
        if count > 0 {
            entry.received.push(reply);
        }
        let done = count == 0 || entry.received.len() as u32 >= entry.expected.unwrap_or(1);
        if done {
            if let Some(tx) = entry.done.take() {
                let results = std::mem::take(&mut entry.received);
                drop(entry);
                self.probes.remove(cid);
                let _ = tx.send(results);
            }
        }
    }

    /// A peer answered with a routing error. Completes the probe
    /// immediately with whatever partial buffer it had collected.
    #[instrument(skip(self))]
    pub fn resolve_probe_error(&self, cid: &str) {
        self.abort_probe(cid);
    }

    fn abort_probe(&self, cid: &str) -> Vec<Stanza> {
        let Some((_, mut entry)) = self.probes.remove(cid) else {
            return Vec::new();
        };
        if let Some(tx) = entry.done.take() {
            let _ = tx.send(std::mem::take(&mut entry.received));
        }
        entry.received
    }

    pub fn pending_probes(&self) -> usize {
        self.probes.len()
    }

    // -- Last-activity aggregation ---------------------------------------

    /// Register a shared-id last-activity fan-out expecting up to
    /// `targets` replies.
    #[instrument(skip(self))]
    pub fn begin_activity(&self, cid: String, targets: usize) -> ActivityHandle {
        let (tx, rx) = oneshot::channel();
        self.activity.insert(
            cid.clone(),
            PendingActivity {
                targets,
                received: 0,
                latest: None,
                done: Some(tx),
            },
        );
        ActivityHandle {
            rx,
            engine: self.clone(),
            cid,
            deadline: MAX_LOOKUP_TIMEOUT,
        }
    }

    /// Feed one peer's `jabber:iq:last` reply in. Keeps the smallest
    /// `seconds` seen so far; completes immediately on `seconds == 0`
    /// (the user is online at that peer right now) or once every target
    /// has answered.
    #[instrument(skip(self))]
    pub fn resolve_activity(&self, cid: &str, host: String, seconds: u64) {
        let Some(mut entry) = self.activity.get_mut(cid) else {
            debug!(correlation_id = %cid, "last-activity reply for unknown or expired lookup");
            return;
        };
        entry.received += 1;
        let better = match &entry.latest {
            Some((_, best)) => seconds < *best,
            None => true,
        };
        if better {
            entry.latest = Some((host, seconds));
        }
        let done = seconds == 0 || entry.received >= entry.targets;
        if done {
            if let Some(tx) = entry.done.take() {
                let latest = entry.latest.take();
                drop(entry);
                self.activity.remove(cid);
                let _ = tx.send(latest);
            }
        }
    }

    fn abort_activity(&self, cid: &str) -> Option<(String, u64)> {
        let (_, mut entry) = self.activity.remove(cid)?;
        let latest = entry.latest.take();
        if let Some(tx) = entry.done.take() {
            let _ = tx.send(latest.clone());
        }
        latest
    }

    pub fn pending_activity(&self) -> usize {
        self.activity.len()
    }
}

/// A handle on an in-flight presence-probe chain for one peer.
pub struct ProbeHandle {
    rx: oneshot::Receiver<Vec<Stanza>>,
    engine: LookupEngine,
    cid: String,
    deadline: Duration,
}

impl ProbeHandle {
    pub fn correlation_id(&self) -> &str {
        &self.cid
    }

    /// Wait for the chain to finish, an error, or the deadline — whichever
    /// comes first.
    pub async fn collect(self) -> Vec<Stanza> {
        let ProbeHandle {
            rx,
            engine,
            cid,
            deadline,
        } = self;
        match timeout(deadline, rx).await {
            Ok(Ok(stanzas)) => stanzas,
            Ok(Err(_)) => Vec::new(),
            Err(_) => engine.abort_probe(&cid),
        }
    }
}

/// A handle on an in-flight last-activity aggregation.
pub struct ActivityHandle {
    rx: oneshot::Receiver<Option<(String, u64)>>,
    engine: LookupEngine,
    cid: String,
    deadline: Duration,
}

impl ActivityHandle {
    pub async fn collect(self) -> Option<(String, u64)> {
        let ActivityHandle {
            rx,
            engine,
            cid,
            deadline,
        } = self;
        match timeout(deadline, rx).await {
            Ok(Ok(latest)) => latest,
            Ok(Err(_)) => None,
            Err(_) => engine.abort_activity(&cid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    fn dummy_presence() -> Stanza {
        Stanza::new(Element::builder("presence", "jabber:component:accept").build())
    }

    #[test]
    fn deadline_scales_with_peer_count() {
        assert!(fanout_deadline(5) > fanout_deadline(1));
    }

    #[tokio::test]
    async fn probe_completes_when_chain_count_reached() {
        let engine = LookupEngine::new();
        let (cid, handle) = engine.begin_probe(Duration::from_secs(5));
        engine.resolve_chain(&cid, dummy_presence(), 2);
        engine.resolve_chain(&cid, dummy_presence(), 1);
        let results = handle.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(engine.pending_probes(), 0);
    }

    #[tokio::test]
    async fn probe_completes_immediately_on_count_zero() {
        let engine = LookupEngine::new();
        let (cid, handle) = engine.begin_probe(Duration::from_secs(5));
        engine.resolve_chain(&cid, dummy_presence(), 0);
        let results = handle.collect().await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn probe_error_completes_with_partial_buffer() {
        let engine = LookupEngine::new();
        let (cid, handle) = engine.begin_probe(Duration::from_secs(5));
        engine.resolve_chain(&cid, dummy_presence(), 3);
        engine.resolve_probe_error(&cid);
        let results = handle.collect().await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out_with_partial_buffer() {
        let engine = LookupEngine::new();
        let (cid, handle) = engine.begin_probe(Duration::from_millis(50));
        engine.resolve_chain(&cid, dummy_presence(), 2);
        let task = tokio::spawn(handle.collect());
        tokio::time::advance(Duration::from_millis(60)).await;
        let results = task.await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn activity_keeps_minimum_seconds() {
        let engine = LookupEngine::new();
        let handle = engine.begin_activity("q1".into(), 2);
        engine.resolve_activity("q1", "beta.kontalk.net".into(), 30);
        engine.resolve_activity("q1", "prime.kontalk.net".into(), 5);
        let latest = handle.collect().await;
        assert_eq!(latest, Some(("prime.kontalk.net".into(), 5)));
    }

    #[tokio::test]
    async fn activity_short_circuits_on_zero_seconds() {
        let engine = LookupEngine::new();
        let handle = engine.begin_activity("q2".into(), 3);
        engine.resolve_activity("q2", "beta.kontalk.net".into(), 0);
        let latest = handle.collect().await;
        assert_eq!(latest, Some(("beta.kontalk.net".into(), 0)));
        assert_eq!(engine.pending_activity(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_times_out_with_no_replies() {
        let engine = LookupEngine::new();
        let handle = engine.begin_activity("q3".into(), 2);
        let task = tokio::spawn(handle.collect());
        tokio::time::advance(MAX_LOOKUP_TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(task.await.unwrap(), None);
    }
}
