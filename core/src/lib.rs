//! A pure, non-I/O reliable-ARQ transport engine.
//!
//! This crate implements the protocol state machine only: segment framing,
//! sliding windows, RTT/RTO estimation, congestion control, and fast
//! retransmit. It owns no socket and spawns no tasks; callers drive it by
//! feeding it incoming datagrams (`Engine::input`), advancing its clock
//! (`Engine::update`), and pulling wire bytes from the `output` sink given
//! at construction. Everything timer- or socket-shaped lives one layer up.

pub mod config;
pub mod engine;
pub mod error;
pub mod modular_cmp;
pub mod rtt;
pub mod segment;

pub use config::{NoDelayConfig, Profile};
pub use engine::{Engine, InputOutcome};
pub use error::EngineError;
pub use segment::{Command, Segment, HEADER_SIZE};
