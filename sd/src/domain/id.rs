//! Run ID generation
//!
//! IDs use the format `{12-char-hex}-{strategy-slug}`, e.g. `9f3c01a2b4de-momentum`.
//! The hex part comes from the random tail of a UUIDv7.

/// Generate a unique run ID for a strategy
pub fn generate_run_id(strategy_code: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    let hex = &uuid[uuid.len() - 12..];
    let slug = slugify(strategy_code);
    if slug.is_empty() {
        hex.to_string()
    } else {
        format!("{}-{}", hex, slug)
    }
}

fn slugify(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
