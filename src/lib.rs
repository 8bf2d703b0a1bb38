//! A coordinator for federated learning.
//!
//! Participants cannot be called by the coordinator: they [rendezvous] once, then poll the
//! coordinator with heartbeats. A heartbeat reply tells a participant whether it has been selected
//! for the current round, in which case it fetches the global model, trains locally and submits
//! its update. Once every live selected participant submitted (or the round deadline elapsed) the
//! updates are averaged into a new global model, weighted by the number of training examples.
//!
//! [rendezvous]: coordinator::core::ServiceHandle::rendezvous

#[macro_use]
extern crate async_trait;

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub mod client;
pub mod common;
pub mod coordinator;
