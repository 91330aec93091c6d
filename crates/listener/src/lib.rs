//! FediTest Embedded Protocol Listener
//!
//! An in-process federation peer: publishes discovery documents for
//! test-owned identities and correlates inbound messages with test steps
//! waiting for them.

pub mod identity;
pub mod inbox;
pub mod routes;
pub mod server;

pub use identity::TestIdentity;
pub use inbox::{
    Delivery, ExpectationHandle, InboundMessage, Inbox, Matcher, RejectedMessage, RunPartition,
};
pub use server::Listener;
