pub mod app;
pub mod commands;
pub mod console;
pub mod context;

pub use app::{Cli, Commands};
