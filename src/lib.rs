pub mod config;
pub mod database;
pub mod engine;
pub mod feed;
pub mod ml;
pub mod notifications;
pub mod types;
