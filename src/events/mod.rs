//! In-process event plane
//!
//! Party-scoped publish/subscribe with ordered delivery, plus the pluggable
//! external publisher that gossips queue and match events over the broker.

pub mod bus;
pub mod publisher;

// Re-export commonly used types
pub use bus::{EventBus, Subscription};
pub use publisher::{BrokerEventPublisher, EventPublisher, MockEventPublisher};
