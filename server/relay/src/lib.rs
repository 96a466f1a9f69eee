//! The voice relay server: session registry, relay state machine, and the
//! poll-loop driver that ties them to the datagram transport.

pub mod config;
pub mod driver;
pub mod metrics_adapter;
pub mod registry;
pub mod relay;
