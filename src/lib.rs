pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod memory;
pub mod models;
pub mod parser;
pub mod session;
pub mod store;
pub mod sync;
pub mod ui;
pub mod view;
