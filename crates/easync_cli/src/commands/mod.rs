//! CLI command implementations.

pub mod cache;
pub mod devices;
pub mod reset;
pub mod states;
pub mod wipe;

use clap::ValueEnum;
use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Prints `report` as JSON, or through `text` otherwise.
pub fn emit<T: Serialize>(
    report: &T,
    format: Format,
    text: impl FnOnce(&T),
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Format::Text => text(report),
    }
    Ok(())
}

/// Formats an optional value, `-` when absent.
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
