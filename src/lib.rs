// Aglogen Assistant — AI tool registry, executor and knowledge search for
// aggregate simulation projects

pub mod assistant;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod logger;
pub mod provider;
pub mod queue;
pub mod rag;
pub mod store;
pub mod tool;
pub mod web;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
