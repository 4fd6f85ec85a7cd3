//! Common utilities and helper functions
//!
//! Text cleanup used before emission, hashing helpers and formatting.

pub mod error;
pub mod retry;

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Normalize whitespace in text
pub fn normalize_whitespace(text: &str) -> String {
    static WHITESPACE_RE: OnceLock<Option<Regex>> = OnceLock::new();

    match WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").ok()) {
        Some(re) => re.replace_all(text.trim(), " ").to_string(),
        None => text.trim().to_string(),
    }
}

/// Remove markdown emphasis, HTML tags and leading label prefixes
///
/// LLM rewrites tend to come back as `**Title:** text`; channels expect
/// plain text.
pub fn strip_markup(text: &str) -> String {
    static EMPHASIS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static LABEL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static LEADING_RE: OnceLock<Option<Regex>> = OnceLock::new();

    if text.is_empty() {
        return String::new();
    }

    let mut out = text.to_string();
    let patterns = [
        (&EMPHASIS_RE, r"\*\*|__"),
        (&TAG_RE, r"<[^>]+>"),
        (
            &LABEL_RE,
            r"(?i)^\s*[#*\s]*(title|headline|description|summary|desc)\s*[:\-]+\s*[#*\s]*",
        ),
        (&LEADING_RE, r"^[\s:\-#*]+"),
    ];

    for (cell, pattern) in patterns {
        if let Some(re) = cell.get_or_init(|| Regex::new(pattern).ok()) {
            out = re.replace_all(&out, "").to_string();
        }
    }

    normalize_whitespace(&out)
}

/// Convert an HTML fragment from a feed into plain text
///
/// Block-level breaks become spaces, tags are dropped and entities decoded.
pub fn html_to_text(html: &str) -> String {
    static BREAK_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();

    let mut out = html.to_string();
    if let Some(re) = BREAK_RE.get_or_init(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6])\s*/?>").ok()) {
        out = re.replace_all(&out, " ").to_string();
    }
    if let Some(re) = TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").ok()) {
        out = re.replace_all(&out, "").to_string();
    }

    normalize_whitespace(&html_escape::decode_html_entities(&out))
}

/// Truncate text to at most `max_chars` characters, cutting on a word boundary
///
/// An ellipsis is appended when anything was removed. Works on characters,
/// never splitting a multi-byte sequence.
pub fn truncate_words(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let budget = max_chars.saturating_sub(3);
    let truncated: String = text.chars().take(budget).collect();
    let ends_on_break = text.chars().nth(budget).map_or(true, char::is_whitespace);
    let cut = match truncated.rfind(' ') {
        _ if ends_on_break => truncated.as_str(),
        Some(idx) if idx > 0 => &truncated[..idx],
        _ => truncated.as_str(),
    };

    format!("{}...", cut.trim_end())
}

/// Lowercase hex SHA-256 of the given parts, fed in order
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Format byte size as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return String::from("0 B");
    }

    let base: f64 = 1024.0;
    let exponent = (bytes as f64).log(base).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes as f64 / base.powi(exponent as i32);

    format!("{value:.2} {}", UNITS[exponent])
}
