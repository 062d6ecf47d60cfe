//! Trade workflow orchestrator

pub mod command;
pub mod engine;


pub use command::{COMMANDS, Command, CommandEntry, FailurePolicy, Surface};
pub use engine::Engine;
