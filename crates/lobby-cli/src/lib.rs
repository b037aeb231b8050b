// lobby-cli: Clap commands, logging, terminal UI
// Depends on lobby-core, lobby-runtime

pub mod commands;
pub mod display;
pub mod logging;
pub mod output;
pub mod ui;

pub use commands::run;
