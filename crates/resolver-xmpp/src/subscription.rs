//! Subscription Registry: who is watching whose presence.
//!
//! This is deliberately not a roster. It does not track `ask`/`subscription`
//! state per RFC 6121 — that belongs to the client-facing subsystem that
//! owns each user's roster storage. The resolver only needs to know, for a
//! bare JID whose presence just changed, which full JIDs elsewhere in the
//! cluster asked to be told about it. `subscribe`/`unsubscribe` are
//! idempotent; the registry is a pure fan-out list, not a state machine.
//!
//! The registry also owns the two stanza-shaped side effects that follow
//! directly from its own state: the synthetic `subscribed` presence sent
//! back the moment a subscription is registered, and the rewrite of a
//! broadcast template's `to` into each subscriber's bare JID.

use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;

use crate::stanza::Stanza;

/// Process-wide table of presence-subscriber lists, keyed by the watched
/// bare JID.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    watchers: Arc<DashMap<BareJid, Vec<FullJid>>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            watchers: Arc::new(DashMap::new()),
        }
    }

    /// Register `watcher` as interested in `watched`'s presence. No-op if
    /// already registered.
    pub fn subscribe(&self, watched: &BareJid, watcher: FullJid) {
        let mut entry = self.watchers.entry(watched.clone()).or_default();
        if !entry.contains(&watcher) {
            entry.push(watcher);
        }
    }

    /// Remove `watcher` from `watched`'s subscriber list. No-op if absent.
    pub fn unsubscribe(&self, watched: &BareJid, watcher: &FullJid) {
        let Some(mut entry) = self.watchers.get_mut(watched) else {
            return;
        };
        entry.retain(|w| w != watcher);
        if entry.is_empty() {
            drop(entry);
            self.watchers.remove(watched);
        }
    }

    /// Remove `subscriber` from every watch list it appears on — the
    /// subscriber's session ended, or their account was removed.
    pub fn cancel_all(&self, subscriber: &FullJid) {
        self.watchers.retain(|_, list| {
            list.retain(|w| w != subscriber);
            !list.is_empty()
        });
    }

    /// Current subscriber list for `watched`, empty if none.
    pub fn subscribers(&self, watched: &BareJid) -> Vec<FullJid> {
        self.watchers
            .get(watched)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Build the synthetic `type=subscribed` presence sent back to
    /// `subscriber` the moment a subscription to `watched` is registered.
    pub fn subscribed_presence(watched: &BareJid, subscriber: &FullJid) -> Stanza {
        let el = Element::builder("presence", "jabber:component:accept")
            .attr("type", "subscribed")
            .attr("from", watched.to_string())
            .attr("to", subscriber.to_string())
            .build();
        Stanza::new(el)
    }

    /// Stamp one copy of `template` per current subscriber of `watched`,
    /// each addressed to that subscriber's bare JID.
    pub fn broadcast(&self, watched: &BareJid, template: &Stanza) -> Vec<Stanza> {
        self.subscribers(watched)
            .into_iter()
            .map(|sub| {
                let mut out = template.clone_unconsumed();
                out.set_to(&Jid::Bare(sub.to_bare()));
                out
            })
            .collect()
    }
}
