pub mod config;
pub mod error;
pub mod model;
pub mod platform;
pub mod registry;
pub mod state;
