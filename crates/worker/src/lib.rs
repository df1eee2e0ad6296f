pub mod config;
pub mod lora;
pub mod orchestrator;
pub mod server;
