//! Application locker: blocks protected applications until they are unlocked
//! with an authenticator code, a recovery key or the legacy PIN

pub mod auth;
pub mod config;
pub mod console;
pub mod daemon;
pub mod engine;
pub mod lease;
pub mod monitor;
pub mod platform;
pub mod registry;
pub mod state;

pub use config::AppLockerConfig;
pub use engine::{AppStatus, Engine};
