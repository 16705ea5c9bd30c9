//! Broadcast Channel
//!
//! One-way, best-effort fan-out from one [`Publisher`] to any number of
//! [`Subscriber`]s. There is no acknowledgement and no topic filtering.
//!
//! # Guarantees
//!
//! - Messages from one publisher reach one connected subscriber in send
//!   order, without duplicates
//! - Nothing is guaranteed across subscribers or publishers
//! - Messages published while no subscriber is connected are lost

mod publisher;
mod subscriber;

pub use publisher::Publisher;
pub use subscriber::{Subscriber, SubscriberStats};
