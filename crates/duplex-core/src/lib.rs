//! duplex-core: negotiation and adaptation core for two-party calls.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: call states, session descriptions, configuration, relay
//!   control messages (no I/O).
//! - **application**: the session actor, the perfect-negotiation engine, the
//!   bitrate adjustor and the port traits they depend on.
//! - **adapters**: QUIC signaling (Quinn), CBOR signal codec, in-memory peer
//!   connection and signaling for tests and headless runs.

pub mod adapters;
pub mod application;
pub mod domain;

pub use application::call_manager::CallManager;
pub use application::negotiation::EngineDeps;
pub use domain::call_state::CallState;
pub use domain::config::SessionConfig;
pub use domain::error::CallError;
pub use domain::identity::PeerId;
