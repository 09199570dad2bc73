pub mod bus;
pub mod config;
pub mod control;
pub mod executor;
pub mod formatter;
pub mod health;
pub mod heartbeat;
pub mod model;
pub mod platform;
pub mod quiet;
pub mod schedule;
pub mod service;
pub mod store;
pub mod survival;
pub mod trigger;
pub mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
