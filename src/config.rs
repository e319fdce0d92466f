//! Environment-driven configuration and the model alias table.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Shared gateway key accepted on `/v1/*` endpoints.
    pub proxy_api_key: String,
    /// Bearer password for the `/api/*` admin surface.
    pub admin_password: String,
    /// Requests per minute across the whole gateway; 0 disables limiting.
    pub rate_limit_per_minute: u32,
    pub enable_compression: bool,
    /// Default AWS region for credentials that don't carry their own.
    pub region: String,
    /// Inactivity timeout while reading the upstream stream, seconds.
    pub stream_read_timeout_secs: u64,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let proxy_api_key = std::env::var("PROXY_API_KEY").unwrap_or_default();
    if proxy_api_key.is_empty() {
        eprintln!("⚠️  PROXY_API_KEY is not set; /v1 endpoints will reject every request until a key is configured.");
    }

    Ok(Config {
        port: std::env::var("PORT")
            .unwrap_or_else(|_| "8000".into())
            .parse()
            .unwrap_or(8000),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://kirogate.db?mode=rwc".into()),
        proxy_api_key,
        admin_password: std::env::var("ADMIN_PASSWORD").unwrap_or_default(),
        rate_limit_per_minute: std::env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        enable_compression: std::env::var("ENABLE_COMPRESSION")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(true),
        region: std::env::var("KIRO_REGION").unwrap_or_else(|_| "us-east-1".into()),
        stream_read_timeout_secs: std::env::var("STREAM_READ_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120),
    })
}

/// Returns the `tracing` filter directive for the `LOG_LEVEL` env var.
pub fn log_filter() -> String {
    match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "trace" => "kirogate=trace,tower_http=debug".into(),
        "debug" => "kirogate=debug,tower_http=debug".into(),
        "warn" => "kirogate=warn".into(),
        "error" => "kirogate=error".into(),
        _ => "kirogate=info".into(),
    }
}

// ── Model table ─────────────────────────────────────────────────

/// External (client-facing) model name → Kiro internal model id.
/// Keys are in normalized form (see [`normalize_model_name`]).
static MODEL_MAPPING: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("claude-opus-4.5", "claude-opus-4.5"),
        ("claude-haiku-4.5", "claude-haiku-4.5"),
        ("claude-sonnet-4.5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-3.7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
        ("auto", "claude-sonnet-4.5"),
        // gpt-* aliases for OpenAI-only clients.
        ("gpt-4o", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("gpt-4o-mini", "claude-haiku-4.5"),
        ("gpt-4.1", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("gpt-5", "claude-opus-4.5"),
    ])
});

static DIGIT_DASH_DIGIT: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(\d)-(\d)").unwrap());

/// Names advertised by `/v1/models`.
pub const AVAILABLE_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-haiku-4-5",
    "claude-sonnet-4-5",
    "claude-sonnet-4",
    "claude-3-7-sonnet-20250219",
];

/// Normalize a client-supplied model name: lowercase, strip the
/// `anthropic/` prefix, a `-thinking` marker and trailing date stamps,
/// fold `_` to `.`, and spell version pairs with a dot (`-4-5` → `-4.5`).
pub fn normalize_model_name(raw: &str) -> String {
    let mut name = raw.trim().to_lowercase();
    if let Some(stripped) = name.strip_prefix("anthropic/") {
        name = stripped.to_string();
    }
    name = name.replace('_', ".");
    for marker in ["-thinking", ":thinking"] {
        if let Some(stripped) = name.strip_suffix(marker) {
            name = stripped.to_string();
        }
    }
    // Trailing -YYYYMMDD date stamp.
    if let Some(idx) = name.rfind('-') {
        let tail = &name[idx + 1..];
        if tail.len() == 8 && tail.chars().all(|c| c.is_ascii_digit()) {
            name.truncate(idx);
        }
    }
    DIGIT_DASH_DIGIT.replace_all(&name, "$1.$2").into_owned()
}

/// Map an external model name to the Kiro internal id.
/// Unknown names return `None` so the caller can reject with a 400.
pub fn internal_model_id(external: &str) -> Option<&'static str> {
    let normalized = normalize_model_name(external);
    if let Some(id) = MODEL_MAPPING.get(normalized.as_str()) {
        return Some(id);
    }
    // A valid internal id passed straight through is accepted as-is.
    MODEL_MAPPING
        .values()
        .find(|v| v.eq_ignore_ascii_case(&normalized) || v.eq_ignore_ascii_case(external))
        .copied()
}

/// True when the model is Opus-class (blocked for free-tier credentials).
pub fn is_opus_class(external: &str) -> bool {
    normalize_model_name(external).contains("opus")
}

/// Some clients opt into thinking purely through the model name.
pub fn model_implies_thinking(external: &str) -> bool {
    external.to_lowercase().contains("thinking")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_aliases() {
        assert_eq!(normalize_model_name("Claude-Sonnet-4-5"), "claude-sonnet-4.5");
        assert_eq!(
            normalize_model_name("anthropic/claude-sonnet-4-5-20250929"),
            "claude-sonnet-4.5"
        );
        assert_eq!(normalize_model_name("claude_sonnet_4-5"), "claude.sonnet.4.5");
        assert_eq!(
            normalize_model_name("claude-3-7-sonnet-20250219"),
            "claude-3.7-sonnet"
        );
        assert_eq!(
            normalize_model_name("claude-sonnet-4-5-thinking"),
            "claude-sonnet-4.5"
        );
    }

    #[test]
    fn maps_known_models() {
        assert_eq!(
            internal_model_id("claude-sonnet-4-5"),
            Some("CLAUDE_SONNET_4_5_20250929_V1_0")
        );
        assert_eq!(internal_model_id("gpt-4o-mini"), Some("claude-haiku-4.5"));
        assert_eq!(internal_model_id("made-up-model"), None);
    }

    #[test]
    fn opus_detection() {
        assert!(is_opus_class("claude-opus-4-5"));
        assert!(!is_opus_class("claude-sonnet-4-5"));
    }
}
