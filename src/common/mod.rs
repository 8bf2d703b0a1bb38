pub mod client;
pub mod logging;
pub mod model;
pub mod settings;
