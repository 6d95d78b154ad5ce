pub mod app;
pub mod config;
pub mod dedup;
pub mod desk;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod provider;
pub mod registry;
pub mod timers;
pub mod types;
pub mod validate;
