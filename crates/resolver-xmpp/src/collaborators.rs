//! Collaborator traits: the boundary between the resolver core and the rest
//! of the deployment.
//!
//! The resolver needs to know which hosts make up the cluster, and needs
//! somewhere to record a local user's presence transitions so the rest of
//! the deployment (e.g. an offline `jabber:iq:last` answer once every peer
//! has been asked) can read them back out. Neither concern is something the
//! resolver owns storage for — both are injected as `Arc<dyn Trait>` so the
//! core stays testable against an in-memory fake and swappable in
//! production without touching the router.

use async_trait::async_trait;
use jid::BareJid;

/// The set of hostnames participating in this cluster, and which of them
/// are permitted to receive server-to-server delivery receipts.
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Every host currently in the cluster, including this process's own.
    async fn hostlist(&self) -> Vec<String>;

    /// Whether `host` is a recognized member of the cluster.
    async fn is_cluster_host(&self, host: &str) -> bool {
        self.hostlist().await.iter().any(|h| h == host)
    }
}

/// Last-activity storage for this process's own local users.
#[async_trait]
pub trait PresenceStorage: Send + Sync {
    /// Persist that `user` is now available, with the given status message.
    async fn presence(&self, user: &BareJid, status: Option<String>);

    /// Update `user`'s last-seen time only, with no status message.
    async fn touch(&self, user: &BareJid);
}

/// A [`Keyring`] backed by a fixed, config-supplied host list. Adequate for
/// clusters whose membership doesn't change without a restart.
pub struct StaticKeyring {
    hosts: Vec<String>,
}

impl StaticKeyring {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Keyring for StaticKeyring {
    async fn hostlist(&self) -> Vec<String> {
        self.hosts.clone()
    }
}

/// A [`PresenceStorage`] that remembers nothing. Suitable for deployments
/// that don't persist last-activity; `jabber:iq:last` queries against an
/// offline local user are answered entirely from peer fan-out in that case.
#[derive(Default)]
pub struct NullPresenceStorage;

#[async_trait]
impl PresenceStorage for NullPresenceStorage {
    async fn presence(&self, _user: &BareJid, _status: Option<String>) {}

    async fn touch(&self, _user: &BareJid) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_keyring_reports_membership() {
        let ring = StaticKeyring::new(vec!["prime.kontalk.net".into(), "beta.kontalk.net".into()]);
        assert!(ring.is_cluster_host("prime.kontalk.net").await);
        assert!(!ring.is_cluster_host("outside.example").await);
    }

    #[tokio::test]
    async fn null_storage_accepts_and_discards_updates() {
        let storage = NullPresenceStorage;
        let user: BareJid = "alice@kontalk.net".parse().unwrap();
        storage.presence(&user, Some("available".into())).await;
        storage.touch(&user).await;
    }
}
