//! modelmesh: a peer-to-peer overlay for routing AI inference.
//!
//! Nodes advertise the model endpoints they host over a shared gossip
//! topic, keep a persistent registry of what their peers offer, and route
//! work to each other two ways:
//!
//! - sealed request/response envelopes broadcast on the topic, correlated
//!   back to the caller by request id
//! - a direct QUIC tunnel that carries raw HTTP for streaming responses
//!
//! The binary wraps all of this behind a small local HTTP API; the library
//! surface is [`node::OverlayNode`] plus the supporting modules.

pub mod api;
pub mod correlate;
pub mod envelope;
pub mod error;
pub mod gate;
pub mod gossip;
pub mod node;
pub mod ranking;
pub mod registry;
pub mod seal;
pub mod store;
pub mod tunnel;

pub use error::OverlayError;
pub use node::{NodeConfig, OverlayNode};
