// externally visible interfaces
pub mod command;
pub mod control_config;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod home_assistant;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod protocol;
pub mod scheduler;
pub mod state;

// internal interfaces
mod home_assistant_config;
