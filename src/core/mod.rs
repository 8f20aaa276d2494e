pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod scheduler;
pub mod store;
pub mod terminal;
