pub mod app;
pub mod bot_detection;
pub mod config;
pub mod error;
pub mod history;
pub mod keeper;
pub mod routes;
pub mod sessions;
pub mod sites;
pub mod state;
