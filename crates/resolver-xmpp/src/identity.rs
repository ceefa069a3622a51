//! Translation between host-scoped and network-scoped identifiers.
//!
//! A deployment presents one logical domain (`network`) to clients while
//! each process answers to its own physical hostname (`servername`). The
//! translator is the only place that knowledge lives: everything else in
//! the resolver speaks in terms of bare/full JIDs and calls out here
//! whenever a stanza crosses the boundary between the two namespaces.

use jid::Jid;

/// Pure, stateless translation between a process's `servername` and the
/// cluster's logical `network` domain.
#[derive(Debug, Clone)]
pub struct IdentityTranslator {
    network: String,
    servername: String,
}

impl IdentityTranslator {
    /// Build a translator for a given network domain and local hostname.
    pub fn new(network: impl Into<String>, servername: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            servername: servername.into(),
        }
    }

    /// The cluster's logical domain.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// This process's physical hostname.
    pub fn servername(&self) -> &str {
        &self.servername
    }

    /// If `j`'s host is `servername`, rewrite it to `network`; otherwise
    /// return `j` unchanged. Idempotent: applying it twice is a no-op past
    /// the first application.
    pub fn translate_to_network(&self, j: &Jid) -> Jid {
        retarget(j, &self.servername, &self.network)
    }

    /// Dual of [`translate_to_network`](Self::translate_to_network): rewrites
    /// `network` to `servername`.
    pub fn translate_to_server(&self, j: &Jid) -> Jid {
        retarget(j, &self.network, &self.servername)
    }

    /// True if `j`'s host is the cluster's logical domain.
    pub fn is_network_scoped(&self, j: &Jid) -> bool {
        j.domain().to_string() == self.network
    }

    /// True if `j`'s host is this process's physical hostname.
    pub fn is_server_scoped(&self, j: &Jid) -> bool {
        j.domain().to_string() == self.servername
    }
}

fn retarget(j: &Jid, from_host: &str, to_host: &str) -> Jid {
    if j.domain().to_string() != from_host {
        return j.clone();
    }
    match j {
        Jid::Bare(bare) => {
            let rebuilt = match bare.node() {
                Some(node) => format!("{node}@{to_host}"),
                None => to_host.to_string(),
            };
            rebuilt
                .parse::<jid::BareJid>()
                .map(Jid::Bare)
                .unwrap_or_else(|_| j.clone())
        }
        Jid::Full(full) => {
            let resource = full.resource();
            let rebuilt = match full.node() {
                Some(node) => format!("{node}@{to_host}/{resource}"),
                None => format!("{to_host}/{resource}"),
            };
            rebuilt
                .parse::<jid::FullJid>()
                .map(Jid::Full)
                .unwrap_or_else(|_| j.clone())
        }
    }
}
