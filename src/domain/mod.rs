pub mod error;
pub mod models;
pub mod property_cache;
pub mod responder;
pub mod settings;
pub mod state_machine;
