//! Presence Stub and Presence Cache: this host's live view of who is
//! online, where, and with what presence — plus the tie-break rule used to
//! reconcile the same user's presence as seen by two different peer hosts.
//!
//! A [`PresenceStub`] holds everything known about one bare user: the most
//! recent presence stanza per resource, in the order resources last
//! announced. A [`PresenceCache`] is the process-wide table of stubs. Per
//! §3 of the design, the cache is keyed by the user's *local part only* —
//! this resolver tracks presence for users of its own `servername`, and the
//! network is logically one domain, so the host component of the key would
//! be redundant (and is the whole reason a translation layer exists at
//! all).

use std::sync::Arc;

use chrono::DateTime;
use dashmap::DashMap;
use indexmap::IndexMap;
use jid::{BareJid, FullJid, Jid};

use crate::stanza::{Kind, Stanza};

/// Everything currently known about one bare user's presence.
///
/// Resources are kept in an [`IndexMap`] so iteration order reflects the
/// order resources last announced themselves — used as the final
/// tie-breaker when priority and delay stamp are both equal.
#[derive(Debug, Clone, Default)]
pub struct PresenceStub {
    resources: IndexMap<String, Stanza>,
}

impl PresenceStub {
    /// An empty stub with no known resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stub directly from an unavailable presence, per §4.2's
    /// tolerated "unavailable observed with no prior stub" path: the result
    /// is, by construction, already empty.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Record `stanza` as the latest presence for `resource`, replacing any
    /// prior entry for that resource.
    pub fn push(&mut self, resource: String, stanza: Stanza) {
        self.resources.insert(resource, stanza);
    }

    /// Remove `resource` from the stub. Returns the removed stanza, if any.
    pub fn pop(&mut self, resource: &str) -> Option<Stanza> {
        self.resources.shift_remove(resource)
    }

    /// A stub is available iff it still has a resource on file. This is the
    /// corrected form of the source's `self._avail == 0` check — the
    /// intent was always "the resource map is empty", not a counter.
    pub fn is_available(&self) -> bool {
        !self.resources.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// The number of resources currently online.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// The "best" (highest-priority) presence on file, breaking ties by
    /// most recently touched resource. Used to answer a probe from a single
    /// stub without enumerating every resource.
    pub fn best_presence(&self) -> Option<&Stanza> {
        self.resources
            .values()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                priority_of(a)
                    .cmp(&priority_of(b))
                    .then_with(|| ia.cmp(ib))
            })
            .map(|(_, s)| s)
    }

    /// The full JID each currently online resource was actually observed
    /// under — the stored stanza's own `from`, not a reconstruction from a
    /// caller-supplied bare. A resource observed via a peer host keeps that
    /// peer's hostname here; this is what lets delivery route to the host
    /// that is actually serving the resource rather than always this
    /// process's own `servername`.
    pub fn jids(&self) -> Vec<FullJid> {
        self.resources
            .values()
            .filter_map(|s| match s.from_jid() {
                Some(Jid::Full(full)) => Some(full),
                _ => None,
            })
            .collect()
    }

    /// The stanza stored for one specific resource.
    pub fn presence_for(&self, resource: &str) -> Option<&Stanza> {
        self.resources.get(resource)
    }

    /// Every presence stanza currently held, in arrival order.
    pub fn presences(&self) -> impl Iterator<Item = &Stanza> {
        self.resources.values()
    }
}

fn priority_of(s: &Stanza) -> i8 {
    s.element()
        .get_child("priority", minidom::NSChoice::Any)
        .and_then(|e| e.text().trim().parse().ok())
        .unwrap_or(0)
}

/// The §3 tie-break comparator: does `candidate` supersede `incumbent` as
/// the authoritative presence for a `(user, resource)` pair observed via
/// two different peer hosts?
///
/// 1. An available presence beats any unavailable one.
/// 2. Else, if both carry a `delay` timestamp, the later one wins.
/// 3. Else, the one carrying a `delay` wins over the one without.
/// 4. Else, they're equal — the incumbent (the first one seen) is kept.
///
/// Delay stamps are parsed with `chrono` rather than compared as raw
/// strings: XEP-0203 allows any valid `xsd:dateTime`, including differing
/// UTC offsets, which a lexicographic compare gets wrong.
pub fn supersedes(candidate: &Stanza, incumbent: &Stanza) -> bool {
    let candidate_available = candidate.kind() == Kind::PresenceAvailable;
    let incumbent_available = incumbent.kind() == Kind::PresenceAvailable;
    if candidate_available != incumbent_available {
        return candidate_available;
    }
    match (parsed_delay(candidate), parsed_delay(incumbent)) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => false,
    }
}

fn parsed_delay(stanza: &Stanza) -> Option<DateTime<chrono::FixedOffset>> {
    let stamp = stanza.delay_stamp()?;
    DateTime::parse_from_rfc3339(&stamp).ok()
}

/// Merge a batch of presences collected from multiple peers — as handed
/// back by the Lookup Engine's probe fan-out — into one presence per
/// resource, applying [`supersedes`] to pick the winner. Runs once on the
/// whole batch, before the deduplicated set is returned to the caller; it
/// never runs on insertion by a single peer.
pub fn merge_batch(stanzas: Vec<Stanza>) -> Vec<Stanza> {
    let mut by_resource: IndexMap<String, Stanza> = IndexMap::new();
    for stanza in stanzas {
        let resource = match stanza.from_jid() {
            Some(Jid::Full(full)) => full.resource().to_string(),
            _ => continue,
        };
        match by_resource.get(&resource) {
            Some(incumbent) if !supersedes(&stanza, incumbent) => {}
            _ => {
                by_resource.insert(resource, stanza);
            }
        }
    }
    by_resource.into_values().collect()
}

/// Process-wide table of [`PresenceStub`]s, keyed by the bare user's local
/// part.
///
/// Wraps a [`DashMap`] rather than one mutex for the whole table: each
/// user's presence history is independently lockable, so readers and
/// writers for different users never contend — the `DashMap` shard lock
/// stands in for the "one mutex per data structure" the design calls for.
#[derive(Clone)]
pub struct PresenceCache {
    stubs: Arc<DashMap<String, PresenceStub>>,
}

impl Default for PresenceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceCache {
    pub fn new() -> Self {
        Self {
            stubs: Arc::new(DashMap::new()),
        }
    }

    fn key_of(bare: &BareJid) -> Option<String> {
        bare.node().map(|n| n.to_string())
    }

    /// Record an `available` presence from `full`. Silent if `full` has no
    /// local part (a bare-host identifier can't have presence).
    pub fn observe_available(&self, full: &FullJid, stanza: Stanza) {
        let Some(key) = Self::key_of(&full.to_bare()) else {
            return;
        };
        self.stubs
            .entry(key)
            .or_default()
            .push(full.resource().to_string(), stanza);
    }

    /// Record an `unavailable` presence from `full`. Tolerated even if no
    /// stub exists yet — a stub is created (already empty) and logged, per
    /// §4.2.
    pub fn observe_unavailable(&self, full: &FullJid) {
        let Some(key) = Self::key_of(&full.to_bare()) else {
            return;
        };
        let Some(mut entry) = self.stubs.get_mut(&key) else {
            tracing::debug!(user = %key, "unavailable presence for unknown stub, tolerated");
            self.stubs.insert(key, PresenceStub::unavailable());
            return;
        };
        entry.pop(&full.resource().to_string());
    }

    /// O(1) read of the stub for `bare`, if any user by that local part has
    /// ever been observed.
    pub fn lookup(&self, bare: &BareJid) -> Option<PresenceStub> {
        let key = Self::key_of(bare)?;
        self.stubs.get(&key).map(|e| e.clone())
    }

    /// True if the exact full JID is currently online.
    pub fn is_available(&self, full: &FullJid) -> bool {
        let Some(key) = Self::key_of(&full.to_bare()) else {
            return false;
        };
        self.stubs
            .get(&key)
            .is_some_and(|stub| stub.presence_for(&full.resource().to_string()).is_some())
    }

    /// `cache_lookup` per §4.2: if `j` is full, the singleton `{j}` when
    /// that exact resource is online, otherwise empty; if `j` is bare, the
    /// set of every resource's full JID currently online for that user.
    /// `None` means no stub exists at all (unknown user), which the router
    /// distinguishes from "known but offline" (`Some` with an empty list).
    pub fn cache_lookup(&self, j: &Jid) -> Option<Vec<FullJid>> {
        match j {
            Jid::Full(full) => {
                let stub = self.lookup(&full.to_bare())?;
                Some(if self.is_available(full) {
                    vec![full.clone()]
                } else {
                    let _ = stub;
                    Vec::new()
                })
            }
            Jid::Bare(bare) => {
                let stub = self.lookup(bare)?;
                Some(stub.jids())
            }
        }
    }

    /// Number of bare users currently tracked (online or known-offline).
    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}
