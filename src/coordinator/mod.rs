pub mod api;
pub mod core;
pub mod models;
pub mod settings;
