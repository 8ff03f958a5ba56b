pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod prompt;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
