//! openclaude: a terminal coding agent that reasons with a chat model and acts through
//! human-approved tools.

pub mod client;
pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod llm_client;
pub mod logging;
pub mod models;
pub mod prompts;
pub mod tools;
