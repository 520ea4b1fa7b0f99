//! Thin interfaces to external collaborators
//!
//! Each adapter pairs a production implementation with a test double: the
//! identity verifier (credential checks on channel attach), the party
//! snapshot store (durable JSON blobs), and the message broker (cross-
//! instance gossip).

pub mod broker;
pub mod identity;
pub mod snapshot;

// Re-export commonly used types
pub use broker::{AmqpBroker, BrokerMessageHandler, MessageBroker, MockBroker};
pub use identity::{IdentityVerifier, JwtIdentityVerifier, StaticIdentityVerifier};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, PartySnapshotStore};
