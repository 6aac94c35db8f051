// Carretón Relay — Configuration
//
// Precedence, lowest first: built-in defaults, the optional TOML file
// (`--config` / `CARRETON_CONFIG`), then CLI flags and their environment
// variables.

use carreton_core::atoms::constants::CONTROL_TIMEOUT_SECS;
use carreton_core::engine::{KeywordSets, ReconnectPolicy, RoutingConfig};
use carreton_core::{EngineError, EngineResult, SessionSettings};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::listener::ListenerConfig;
use crate::engine::whatsapp::EvolutionConfig;

// ── CLI ────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "carreton")]
#[command(about = "WhatsApp relay for solicitations and cancellations", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "CARRETON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listener port (webhook + monitoring)
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Listener bind address
    #[arg(long, env = "CARRETON_BIND")]
    pub bind: Option<String>,

    /// Evolution API base URL
    #[arg(long, env = "EVOLUTION_API_URL")]
    pub api_url: Option<String>,

    /// Evolution API key
    #[arg(long, env = "EVOLUTION_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Evolution instance name
    #[arg(long, env = "EVOLUTION_INSTANCE")]
    pub instance: Option<String>,

    /// URL the Evolution API should post webhooks to
    #[arg(long, env = "CARRETON_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Initial source conversation id
    #[arg(long, env = "CARRETON_SOURCE")]
    pub source: Option<String>,

    /// Initial destination conversation id
    #[arg(long, env = "CARRETON_DESTINATION")]
    pub destination: Option<String>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

// ── Config Struct ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub evolution: EvolutionConfig,
    pub listener: ListenerConfig,
    pub keywords: KeywordSets,
    pub routing: RoutingConfig,
    pub reconnect: ReconnectPolicy,
    /// Upper bound for a single send call and for each Evolution request.
    pub send_timeout_secs: u64,
    /// Upper bound for a session start or logout.
    pub control_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            evolution: EvolutionConfig::default(),
            listener: ListenerConfig::default(),
            keywords: KeywordSets::default(),
            routing: RoutingConfig::default(),
            reconnect: ReconnectPolicy::default(),
            send_timeout_secs: 30,
            control_timeout_secs: CONTROL_TIMEOUT_SECS,
        }
    }
}

impl RelayConfig {
    /// Defaults, overlaid with the TOML file at `path` when given.
    /// A path that was asked for but cannot be read is an error.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Read {}: {}", path.display(), e)))?;
        Self::from_toml(&raw).map_err(|e| match e {
            EngineError::Config(msg) => EngineError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Full resolution: file named by the CLI, then CLI / env overrides.
    pub fn resolve(cli: &Cli) -> EngineResult<Self> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.listener.port = port;
        }
        if let Some(bind) = &cli.bind {
            self.listener.bind_address = bind.clone();
        }
        if let Some(url) = &cli.api_url {
            self.evolution.api_url = url.clone();
        }
        if let Some(key) = &cli.api_key {
            self.evolution.api_key = key.clone();
        }
        if let Some(instance) = &cli.instance {
            self.evolution.instance_name = instance.clone();
        }
        if let Some(url) = &cli.webhook_url {
            self.evolution.webhook_url = Some(url.clone());
        }
        if let Some(source) = &cli.source {
            self.routing.source = Some(source.clone());
        }
        if let Some(destination) = &cli.destination {
            self.routing.destination = Some(destination.clone());
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.evolution.instance_name.trim().is_empty() {
            return Err(EngineError::Config("evolution.instance_name must not be empty".into()));
        }
        if self.evolution.api_key.trim().is_empty() {
            return Err(EngineError::Config(
                "evolution.api_key is required (--api-key / EVOLUTION_API_KEY)".into(),
            ));
        }
        let url = self.evolution.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            let msg = format!("evolution.api_url must be an http(s) URL, got '{}'", url);
            return Err(EngineError::Config(msg));
        }
        if self.send_timeout_secs == 0 || self.control_timeout_secs == 0 {
            return Err(EngineError::Config("timeouts must be positive".into()));
        }
        if self.listener.read_timeout_secs == 0 {
            return Err(EngineError::Config("listener.read_timeout_secs must be positive".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(EngineError::Config(
                "reconnect.base_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn webhook_url(&self) -> String {
        self.evolution.webhook_url_or_default(self.listener.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            policy: self.reconnect.clone(),
            keywords: self.keywords.clone(),
            routing: self.routing.clone(),
            send_timeout: self.send_timeout(),
            control_timeout: Duration::from_secs(self.control_timeout_secs),
        }
    }
}
