//! I/O helpers: configuration, child processes, model backends, prompts,
//! progress events and request storage.

pub mod config;
pub mod events;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod store;
