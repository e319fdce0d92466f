//! Gateway-issued API keys (`kg-` prefix).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    /// The raw key. Returned to the caller exactly once at creation;
    /// admin reads only ever see the masked form.
    pub key: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restrict to these models; empty means all.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Restrict to these credential ids; empty means the shared pool.
    #[serde(default)]
    pub allowed_credentials: Vec<String>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ApiKeyRecord {
    pub fn generate(name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            key: format!("kg-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            enabled: true,
            allowed_models: Vec::new(),
            allowed_credentials: Vec::new(),
            request_count: 0,
            created_at: Some(Utc::now()),
            last_used: None,
        }
    }

    /// `kg-12ab****90ef`: enough to recognize, useless to replay.
    pub fn masked_key(&self) -> String {
        if self.key.len() <= 11 {
            return "kg-****".to_string();
        }
        format!("{}****{}", &self.key[..7], &self.key[self.key.len() - 4..])
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty()
            || self
                .allowed_models
                .iter()
                .any(|m| m.eq_ignore_ascii_case(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_prefix() {
        let key = ApiKeyRecord::generate("ci");
        assert!(key.key.starts_with("kg-"));
        assert!(key.enabled);
    }

    #[test]
    fn masking_hides_the_middle() {
        let key = ApiKeyRecord::generate("ci");
        let masked = key.masked_key();
        assert!(masked.contains("****"));
        assert_ne!(masked, key.key);
        assert!(masked.starts_with("kg-"));
    }

    #[test]
    fn model_allowlist() {
        let mut key = ApiKeyRecord::generate("ci");
        assert!(key.allows_model("claude-opus-4-5"));
        key.allowed_models = vec!["claude-haiku-4-5".into()];
        assert!(!key.allows_model("claude-opus-4-5"));
        assert!(key.allows_model("claude-haiku-4-5"));
    }
}
