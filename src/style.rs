//! Terminal styling utilities for consistent CLI output.
//!
//! Respects `NO_COLOR` and terminal capabilities.

use std::sync::OnceLock;

use owo_colors::OwoColorize;

static COLOR_ENABLED: OnceLock<bool> = OnceLock::new();

/// Check if colors should be used (cached on first call).
pub fn colors_enabled() -> bool {
   *COLOR_ENABLED.get_or_init(|| {
      // NO_COLOR takes precedence (https://no-color.org/)
      if std::env::var("NO_COLOR").is_ok() {
         return false;
      }
      supports_color::on(supports_color::Stream::Stdout).is_some_and(|level| level.has_basic)
   })
}

/// Success: completed actions (green + bold).
pub fn success(s: &str) -> String {
   if colors_enabled() { s.green().bold().to_string() } else { s.to_string() }
}

/// Warning: non-fatal issues (yellow).
pub fn warning(s: &str) -> String {
   if colors_enabled() { s.yellow().to_string() } else { s.to_string() }
}

/// Error: hard failures (red + bold).
pub fn error(s: &str) -> String {
   if colors_enabled() { s.red().bold().to_string() } else { s.to_string() }
}

/// Dim: less important details, file paths.
pub fn dim(s: &str) -> String {
   if colors_enabled() { s.dimmed().to_string() } else { s.to_string() }
}

/// Bold: headers, key values.
pub fn bold(s: &str) -> String {
   if colors_enabled() { s.bold().to_string() } else { s.to_string() }
}
