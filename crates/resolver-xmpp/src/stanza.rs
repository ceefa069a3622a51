//! Stanza classification and the `consumed` handling flag.
//!
//! Stanzas arrive from the transport as bare XML elements. The router needs
//! a uniform, cheaply clonable representation it can inspect, rewrite
//! (`to`, `original-to`), and tag as "a handler has taken responsibility for
//! the response" without losing any extension content a typed stanza model
//! would otherwise drop (the Kontalk stanza-group chain framing, XEP-0203
//! delay stamps used by the tie-break rule, and so on). [`Stanza`] wraps a
//! [`minidom::Element`] with that one extra bit of state.

use jid::Jid;
use minidom::Element;
use rand::Rng;

/// Namespace for the presence-chain framing extension.
pub const NS_STANZA_GROUP: &str = "http://kontalk.org/ns/stanza-group";
/// `jabber:iq:roster`
pub const NS_IQ_ROSTER: &str = "jabber:iq:roster";
/// `jabber:iq:last`
pub const NS_IQ_LAST: &str = "jabber:iq:last";
/// `jabber:iq:version`
pub const NS_IQ_VERSION: &str = "jabber:iq:version";
/// XEP-0203 delayed delivery.
pub const NS_DELAY: &str = "urn:xmpp:delay";
/// Server-to-client delivery receipt notice used internally between the
/// resolver and the client-to-server subsystem.
pub const NS_SERVER_RECEIPTS: &str = "http://kontalk.org/ns/system";

/// A stanza in flight through the resolver, tagged with the `consumed`
/// flag described by the handler-chain design.
#[derive(Debug, Clone)]
pub struct Stanza {
    element: Element,
    consumed: bool,
}

/// Coarse classification of a stanza's top-level name and `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    PresenceAvailable,
    PresenceUnavailable,
    PresenceProbe,
    PresenceSubscribe,
    PresenceUnsubscribe,
    PresenceSubscribed,
    PresenceError,
    PresenceOther,
    IqGet,
    IqSet,
    IqResult,
    IqError,
    Message,
    Other,
}

impl Kind {
    /// Stable lowercase label for metrics tags.
    pub fn label(&self) -> &'static str {
        match self {
            Kind::PresenceAvailable => "presence_available",
            Kind::PresenceUnavailable => "presence_unavailable",
            Kind::PresenceProbe => "presence_probe",
            Kind::PresenceSubscribe => "presence_subscribe",
            Kind::PresenceUnsubscribe => "presence_unsubscribe",
            Kind::PresenceSubscribed => "presence_subscribed",
            Kind::PresenceError => "presence_error",
            Kind::PresenceOther => "presence_other",
            Kind::IqGet => "iq_get",
            Kind::IqSet => "iq_set",
            Kind::IqResult => "iq_result",
            Kind::IqError => "iq_error",
            Kind::Message => "message",
            Kind::Other => "other",
        }
    }
}

impl Stanza {
    /// Wrap a freshly received element, unconsumed.
    pub fn new(element: Element) -> Self {
        Self {
            element,
            consumed: false,
        }
    }

    /// Classify this stanza's name/type for dispatch.
    pub fn kind(&self) -> Kind {
        match self.element.name() {
            "presence" => match self.type_attr() {
                None => Kind::PresenceAvailable,
                Some("unavailable") => Kind::PresenceUnavailable,
                Some("probe") => Kind::PresenceProbe,
                Some("subscribe") => Kind::PresenceSubscribe,
                Some("unsubscribe") => Kind::PresenceUnsubscribe,
                Some("subscribed") => Kind::PresenceSubscribed,
                Some("error") => Kind::PresenceError,
                Some(_) => Kind::PresenceOther,
            },
            "iq" => match self.type_attr() {
                Some("get") => Kind::IqGet,
                Some("set") => Kind::IqSet,
                Some("result") => Kind::IqResult,
                Some("error") => Kind::IqError,
                _ => Kind::Other,
            },
            "message" => Kind::Message,
            _ => Kind::Other,
        }
    }

    /// Has a handler already taken responsibility for responding to this
    /// stanza?
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Mark this stanza as consumed. Idempotent.
    pub fn consume(&mut self) {
        self.consumed = true;
    }

    fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// Stanza `id` attribute, if present.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Parsed `from` JID, if present and well-formed.
    pub fn from_jid(&self) -> Option<Jid> {
        self.element.attr("from").and_then(|s| s.parse().ok())
    }

    /// Parsed `to` JID, if present and well-formed.
    pub fn to_jid(&self) -> Option<Jid> {
        self.element.attr("to").and_then(|s| s.parse().ok())
    }

    /// Overwrite the `to` attribute.
    pub fn set_to(&mut self, to: &Jid) {
        self.element.set_attr("to", to.to_string());
    }

    /// Overwrite the `from` attribute.
    pub fn set_from(&mut self, from: &Jid) {
        self.element.set_attr("from", from.to_string());
    }

    /// Preserve the network-scoped recipient under `original-to` before the
    /// router rewrites `to` to a host-scoped destination.
    pub fn stash_original_to(&mut self) {
        if let Some(to) = self.element.attr("to").map(str::to_owned) {
            self.element.set_attr("original-to", to);
        }
    }

    /// The child `<query xmlns=.../>` element's namespace, for IQ dispatch.
    pub fn query_namespace(&self) -> Option<String> {
        self.element
            .get_child("query", minidom::NSChoice::Any)
            .map(|e| e.ns())
    }

    /// The child `<query>` element itself.
    pub fn query(&self) -> Option<&Element> {
        self.element.get_child("query", minidom::NSChoice::Any)
    }

    /// Roster `<item jid=.../>` children of the `<query>` element.
    pub fn roster_items(&self) -> Vec<Jid> {
        let Some(query) = self.query() else {
            return Vec::new();
        };
        query
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(|c| c.attr("jid"))
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// The chain-framing `<group id=.. count=../>` element, if present.
    pub fn group(&self) -> Option<(&str, u32)> {
        let group = self
            .element
            .get_child("group", NS_STANZA_GROUP)?;
        let id = group.attr("id")?;
        let count: u32 = group.attr("count")?.parse().ok()?;
        Some((id, count))
    }

    /// Attach a chain-framing `<group id=cid count=n/>` element.
    pub fn set_group(&mut self, cid: &str, count: u32) {
        let group = Element::builder("group", NS_STANZA_GROUP)
            .attr("id", cid)
            .attr("count", count.to_string())
            .build();
        self.element.append_child(group);
    }

    /// XEP-0203 `<delay stamp=.../>` timestamp, if present.
    pub fn delay_stamp(&self) -> Option<String> {
        self.element
            .get_child("delay", NS_DELAY)
            .and_then(|e| e.attr("stamp"))
            .map(str::to_owned)
    }

    /// Extract a `<received id=.../>` receipt child, if any.
    pub fn receipt_id(&self) -> Option<String> {
        self.element
            .children()
            .find(|c| c.name() == "received")
            .and_then(|e| e.attr("id"))
            .map(str::to_owned)
    }

    /// `<status>` child text of a presence stanza, if present and non-empty.
    pub fn status_text(&self) -> Option<String> {
        self.element
            .get_child("status", minidom::NSChoice::Any)
            .map(|e| e.text())
            .filter(|s| !s.is_empty())
    }

    /// `seconds` attribute of a `jabber:iq:last` `<query>` reply.
    pub fn last_seconds(&self) -> Option<u64> {
        self.query()?.attr("seconds")?.parse().ok()
    }

    /// Consume and return the inner element.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// Borrow the inner element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Clone this stanza's element as the body of a new, unconsumed stanza
    /// (used when fanning the same payload out to several recipients).
    pub fn clone_unconsumed(&self) -> Self {
        Self {
            element: self.element.clone(),
            consumed: false,
        }
    }
}

/// Generate an 8-character lowercase-alphanumeric correlation id.
pub fn new_correlation_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
