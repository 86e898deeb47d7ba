pub mod call_events;
pub mod loopback;
pub mod path_monitor;
pub mod quic;
pub mod signal_codec;
