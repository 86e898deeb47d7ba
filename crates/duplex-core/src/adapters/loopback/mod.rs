//! In-memory adapters for tests, demos and headless runs.

pub mod peer_connection;
pub mod signaling;
