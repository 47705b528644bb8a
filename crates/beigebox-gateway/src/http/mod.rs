pub mod agents;
pub mod chat;
pub mod config_api;
pub mod derived;
pub mod models;
pub mod ops;
