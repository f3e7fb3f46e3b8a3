pub mod config;
pub mod cron;
pub mod database;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod models;
pub mod path_format;
pub mod progress;
pub mod queue;
pub mod render;
pub mod retention;
pub mod routes;
pub mod scheduler;
pub mod settings;
pub mod source;
pub mod store;
pub mod window;
pub mod worker_processing;
