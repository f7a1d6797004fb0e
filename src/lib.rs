pub mod client;
pub mod config;
pub mod core;
pub mod net;
pub mod protocol;
pub mod telemetry;
pub mod utils;
