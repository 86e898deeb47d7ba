pub mod call_state;
pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod media;
pub mod peer;
pub mod signal;
