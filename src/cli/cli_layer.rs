// CLI layer - argument parsing, command handlers, and terminal rendering.

#[path = "commands.rs"]
pub mod commands;

#[path = "render.rs"]
pub mod render;

pub use commands::Cli;
