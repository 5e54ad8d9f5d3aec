//! GPS location ingestion and retention

pub mod api;
pub mod codec;
pub mod config;
pub mod database;
pub mod directory;
pub mod errors;
pub mod geo;
pub mod models;
pub mod mqtt;
pub mod notifier;
pub mod pipeline;
pub mod retention;
pub mod storage;
