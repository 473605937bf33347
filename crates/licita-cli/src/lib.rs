//! Licita CLI - command-line interface tying the engine together.

pub mod config;

pub use config::{Command, Config, ExportFormat};
