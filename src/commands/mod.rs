//! Entity command parsing and execution
//!
//! Turns request bodies into `Command`s and runs them against the backend
//! the dispatcher selects.

pub mod handlers;
pub mod parser;

pub use parser::{Command, EntityCommand, EntityRequest, parse_action, parse_operation};
