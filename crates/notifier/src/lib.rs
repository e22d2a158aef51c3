//! Notification model, HTTP delivery and the producer-facing agent.

pub mod agent;
pub mod codec;
pub mod delivery;
pub mod message;
pub mod transport;

pub use agent::{NotifyAgent, Submission};
pub use delivery::{DeliveryEngine, DeliveryOutcome};
pub use message::NotifyMessage;
