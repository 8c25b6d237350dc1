// Re-export internal modules for the binaries, integration tests and external crate use.
pub mod cherrypick;
pub mod commands;
pub mod config;
pub mod error;
pub mod gate;
pub mod git;
pub mod lexer;
pub mod lgtm;
pub mod logging;
pub mod model;
pub mod permission;
pub mod platform;
pub mod processor;
pub mod render;
pub mod webhook;

pub use error::{ErrorKind, PrError, Result};
pub use model::Trigger;
pub use processor::{Outcome, process};
