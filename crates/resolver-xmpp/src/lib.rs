//! # resolver-xmpp
//!
//! The Resolver: the federation-facing core of a Kontalk-style XMPP
//! cluster. Every stanza a cluster member hands to this component passes
//! through [`router::Resolver::handle`], which translates addressing
//! between a process's physical hostname and the cluster's logical network
//! domain, tracks who is online and where (`presence`), who is watching
//! whose presence (`subscription`), and fans cluster-wide questions out to
//! peer hosts and back (`lookup`).
//!
//! This crate has no transport of its own. The host binary owns the actual
//! socket, decodes XML into [`stanza::Stanza`], and implements
//! [`router::Outbound`] to hand replies back out; this crate only ever sees
//! that trait object.

pub mod collaborators;
pub mod error;
pub mod identity;
pub mod lookup;
pub mod metrics;
pub mod presence;
pub mod router;
pub mod stanza;
pub mod subscription;

pub use collaborators::{Keyring, NullPresenceStorage, PresenceStorage, StaticKeyring};
pub use error::ResolverError;
pub use identity::IdentityTranslator;
pub use lookup::LookupEngine;
pub use presence::{PresenceCache, PresenceStub};
pub use router::{Outbound, Resolver};
pub use stanza::{Kind, Stanza};
pub use subscription::SubscriptionRegistry;
