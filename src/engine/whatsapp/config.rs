// WhatsApp Bridge — Evolution API Configuration
// EvolutionConfig: where the operator's Evolution server lives and how to
// authenticate against it.

use serde::{Deserialize, Serialize};

// ── Config Struct ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Evolution API base URL
    pub api_url: String,
    /// Key configured on the Evolution server (`AUTHENTICATION_API_KEY`).
    /// Required; there is no usable default.
    pub api_key: String,
    /// Instance name for Evolution API (default: "carreton")
    pub instance_name: String,
    /// URL the Evolution API posts webhooks to. Derived from the listener
    /// port when unset.
    pub webhook_url: Option<String>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        EvolutionConfig {
            api_url: "http://127.0.0.1:8085".into(),
            api_key: String::new(),
            instance_name: "carreton".into(),
            webhook_url: None,
        }
    }
}

impl EvolutionConfig {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn webhook_url_or_default(&self, listener_port: u16) -> String {
        match self.webhook_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("http://host.docker.internal:{}/webhook/whatsapp", listener_port),
        }
    }
}
