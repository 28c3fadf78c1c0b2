//! Formatting helpers for task display.

use std::sync::LazyLock;

use regex::Regex;

static FONT_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<font color='([a-z]*)'>(.*)</font>").expect("valid regex"));

/// Formats a byte count as a human-readable string (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats a speed field (bytes per second, as a decimal string).
/// Unparseable input is returned unchanged.
#[must_use]
pub fn format_speed(raw: &str) -> String {
    raw.trim()
        .parse::<u64>()
        .map_or_else(|_| raw.to_string(), |b| format!("{}/s", format_bytes(b)))
}

/// Strips the `<font color='..'>` wrapper the remote puts around live times.
#[must_use]
pub fn trim_font_tag(raw: &str) -> &str {
    FONT_TAG_RE
        .captures(raw)
        .and_then(|c| c.get(2))
        .map_or(raw, |m| m.as_str())
}
