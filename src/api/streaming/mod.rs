//! Realtime quote streaming over the provider's multiplexed WebSocket.
//!
//! One connection carries every subscription. [`StreamManager`] owns the
//! connection lifecycle (connect, reconcile subscriptions, reconnect on a
//! fixed delay) and publishes decoded ticks through a broadcast fan-out plus
//! a latest-tick map. [`frame`] decodes the provider's delimited text
//! protocol into typed frames.

pub mod frame;
mod manager;

pub use frame::{ControlMessage, FrameError, StreamFrame, Tick};
pub use manager::{
    StreamConfig, StreamManager, StreamStatus, SubscriptionHandle, SubscriptionKey,
};
