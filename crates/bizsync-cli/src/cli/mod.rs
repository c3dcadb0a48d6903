pub mod config;
pub mod demo;

pub use config::{default_config_path, resolve_config};
pub use demo::{run_demo, DemoReport};
