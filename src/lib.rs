//! rosie: dispatch and node-status service for hardware-in-the-loop
//! firmware testing.
//!
//! A dispatch API accepts "test this commit" requests and queues them in a
//! shared store; node agents attached to physical boards claim jobs one at a
//! time, run the external test controller, and hand an assembled report to
//! a delivery sink.

pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod logging;
pub mod web;
