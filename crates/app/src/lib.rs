#![deny(unsafe_code)]

/// Startup and shutdown of the terminal host.
pub mod app;
/// Host errors.
pub mod error;
/// Line-oriented front end over the session.
pub mod repl;
/// Settings persistence.
pub mod settings;
