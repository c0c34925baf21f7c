//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::client::RatePair;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file, falling back to table
    pub fn from_name(name: Option<&str>) -> Self {
        name.and_then(|n| OutputFormat::from_str(n, true).ok())
            .unwrap_or_default()
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// `276.0/18.4 Mbps`, or a dash when absent
pub fn format_rate(rate: Option<RatePair>) -> String {
    match rate {
        Some(r) => format!("{:.1}/{:.1} Mbps", r.down_mbps, r.up_mbps),
        None => "-".to_string(),
    }
}

pub fn format_percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}

/// Age relative to `now`, e.g. `5m ago`
pub fn format_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "-".to_string();
    };
    let secs = (now - at).num_seconds().max(0);
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}

pub fn day_name(day_of_week: u8) -> &'static str {
    match day_of_week {
        0 => "Mon",
        1 => "Tue",
        2 => "Wed",
        3 => "Thu",
        4 => "Fri",
        5 => "Sat",
        6 => "Sun",
        _ => "?",
    }
}

/// Color a link mode
pub fn color_mode(mode: &str) -> String {
    match mode {
        "active" => mode.green().to_string(),
        "learning" => mode.yellow().to_string(),
        _ => mode.to_string(),
    }
}

/// Color an alert severity
pub fn color_severity(severity: &str) -> String {
    match severity {
        "critical" => severity.red().bold().to_string(),
        "warning" => severity.yellow().to_string(),
        "info" => severity.blue().to_string(),
        _ => severity.to_string(),
    }
}

pub fn color_backoff(active: bool) -> String {
    if active {
        "yes".red().to_string()
    } else {
        "no".green().to_string()
    }
}
