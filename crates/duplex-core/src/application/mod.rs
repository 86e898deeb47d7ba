pub mod ports;

pub mod adjustment_tracker;
pub mod bitrate_adapt;
pub mod call_manager;
pub mod candidate_cache;
pub mod negotiation;
pub mod network_data;
pub mod session;
