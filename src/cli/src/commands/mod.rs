pub mod breakers;
pub mod config;
pub mod events;
pub mod health;
pub mod status;
pub mod submit;
