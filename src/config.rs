//! Configuration management
//!
//! Manages realtime transport, capture, tool, session, credit and auth settings.

use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Speech model connection settings
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Local voice-activity detection settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Tool execution settings
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Credit ledger settings
    #[serde(default)]
    pub credits: CreditsConfig,
    /// JWT authentication settings
    #[serde(default)]
    pub auth: AuthConfig,
    /// Relay server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Wire format spoken by the remote end of the transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// A relay speaking the normalized event vocabulary verbatim
    Relay,
    /// OpenAI Realtime native events
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the model or relay
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model name, sent as the endpoint's `model` query parameter.
    /// Empty leaves the endpoint as written.
    #[serde(default = "default_realtime_model")]
    pub model: String,
    /// Voice / persona
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Behavioral instructions
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_dialect")]
    pub dialect: Dialect,
    /// Continuous-stream chunk length (milliseconds)
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,
    /// Sample rate of PCM16 audio exchanged with the model
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_realtime_model() -> String {
    "gpt-realtime".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_instructions() -> String {
    "You are a helpful assistant in a live voice conversation. Keep replies short and \
     conversational. Use the available tools when the user asks for an action, then \
     briefly tell the user what happened."
        .to_string()
}

fn default_dialect() -> Dialect {
    Dialect::Openai
}

fn default_chunk_ms() -> u64 {
    40
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_connect_timeout() -> u64 {
    15
}

impl RealtimeConfig {
    /// The endpoint to dial, with `model` replacing any model already in
    /// its query
    pub fn endpoint_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid realtime endpoint: {}", self.endpoint))?;
        if !self.model.is_empty() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != "model")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut().clear().extend_pairs(kept).append_pair("model", &self.model);
        }
        Ok(url)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_realtime_model(),
            voice: default_voice(),
            instructions: default_instructions(),
            dialect: default_dialect(),
            chunk_ms: default_chunk_ms(),
            sample_rate: default_sample_rate(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// How microphone audio reaches the model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Local end-of-speech detection, one utterance per turn (half duplex)
    Buffered,
    /// Live forwarding; the model detects speech boundaries (full duplex)
    Stream,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Buffered => write!(f, "buffered"),
            CaptureMode::Stream => write!(f, "stream"),
        }
    }
}

/// Audio capture and VAD settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Strategy used when a client does not choose one
    #[serde(default = "default_capture_mode")]
    pub mode: CaptureMode,
    /// Loudness poll interval (milliseconds)
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Speech threshold in dBFS
    #[serde(default = "default_threshold_db")]
    pub speech_threshold_db: f32,
    /// Minimum recording before an end-of-speech decision (milliseconds)
    #[serde(default = "default_min_recording")]
    pub min_recording_ms: u64,
    /// Fixed close time when metering is unavailable (milliseconds)
    #[serde(default = "default_fallback_ms")]
    pub fallback_timeout_ms: u64,
    /// Hard cap on a single utterance (milliseconds)
    #[serde(default = "default_max_utterance")]
    pub max_utterance_ms: u64,
}

fn default_capture_mode() -> CaptureMode {
    CaptureMode::Buffered
}

fn default_poll_ms() -> u64 {
    100
}

fn default_threshold_db() -> f32 {
    -40.0
}

fn default_min_recording() -> u64 {
    500
}

fn default_fallback_ms() -> u64 {
    2500
}

fn default_max_utterance() -> u64 {
    30_000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: default_capture_mode(),
            poll_interval_ms: default_poll_ms(),
            speech_threshold_db: default_threshold_db(),
            min_recording_ms: default_min_recording(),
            fallback_timeout_ms: default_fallback_ms(),
            max_utterance_ms: default_max_utterance(),
        }
    }
}

/// A tool served by an external HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpToolConfig {
    pub name: String,
    pub description: String,
    /// POST target; receives the call arguments as JSON
    pub url: String,
    /// JSON schema of the arguments
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    /// Credits charged per successful call (0 = free)
    #[serde(default)]
    pub cost: u64,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Upper bound on a single handler invocation (seconds)
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// HTTP-backed tools registered at startup
    #[serde(default)]
    pub http: Vec<HttpToolConfig>,
}

fn default_handler_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout(),
            http: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Tear the session down after this long without audio or events (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Turns kept in the in-memory transcript
    #[serde(default = "default_transcript_capacity")]
    pub transcript_capacity: usize,
    /// Turns replayed into the instructions after a reconnect
    #[serde(default = "default_replay_turns")]
    pub replay_turns: usize,
    /// Reconnect attempts after a transport failure before the session ends
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Delay before the first reconnect attempt (milliseconds, doubles per attempt)
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    /// Media items kept per session for media queries
    #[serde(default = "default_media_cache")]
    pub media_cache: usize,
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_transcript_capacity() -> usize {
    200
}

fn default_replay_turns() -> usize {
    8
}

fn default_max_reconnects() -> u32 {
    2
}

fn default_reconnect_backoff() -> u64 {
    500
}

fn default_media_cache() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            transcript_capacity: default_transcript_capacity(),
            replay_turns: default_replay_turns(),
            max_reconnects: default_max_reconnects(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            media_cache: default_media_cache(),
        }
    }
}

/// Which credit ledger backs paid tools
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Memory,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_ledger_kind")]
    pub ledger: LedgerKind,
    /// Base URL of the billing service (http ledger)
    #[serde(default)]
    pub ledger_url: Option<String>,
    /// Opening balances for the in-memory ledger
    #[serde(default)]
    pub initial_balances: HashMap<String, i64>,
    /// Opening balance for owners not listed above
    #[serde(default)]
    pub default_balance: i64,
}

fn default_ledger_kind() -> LedgerKind {
    LedgerKind::Memory
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger_kind(),
            ledger_url: None,
            initial_balances: HashMap::new(),
            default_balance: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT secret key (auto-generated if not set)
    pub jwt_secret: Option<String>,
    /// Access token expiration (minutes)
    #[serde(default = "default_token_expiry")]
    pub access_token_expiry_minutes: i64,
}

fn default_token_expiry() -> i64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_expiry_minutes: default_token_expiry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            realtime: RealtimeConfig::default(),
            capture: CaptureConfig::default(),
            tools: ToolsConfig::default(),
            session: SessionConfig::default(),
            credits: CreditsConfig::default(),
            auth: AuthConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from a file, writing defaults if it does not exist
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        let parent = path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Generate and save JWT secret if not exists
    pub fn ensure_jwt_secret(&mut self) -> Result<String> {
        if let Some(secret) = &self.auth.jwt_secret {
            return Ok(secret.clone());
        }

        let secret = crate::server::auth::generate_jwt_secret();
        self.auth.jwt_secret = Some(secret.clone());
        self.save()?;
        Ok(secret)
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "talkbridge", "talkbridge")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("Realtime");
    match config.realtime.endpoint_url() {
        Ok(url) => println!("  endpoint:        {}", url),
        Err(_) => println!("  endpoint:        {} (invalid)", config.realtime.endpoint),
    }
    println!("  model:           {}", config.realtime.model);
    println!("  voice:           {}", config.realtime.voice);
    println!("  dialect:         {:?}", config.realtime.dialect);
    println!("Capture");
    println!("  mode:            {:?}", config.capture.mode);
    println!("  poll interval:   {} ms", config.capture.poll_interval_ms);
    println!("  threshold:       {} dB", config.capture.speech_threshold_db);
    println!("  max utterance:   {} ms", config.capture.max_utterance_ms);
    println!("Tools");
    println!("  handler timeout: {} s", config.tools.handler_timeout_secs);
    for tool in &config.tools.http {
        println!("  - {} ({} credits) -> {}", tool.name, tool.cost, tool.url);
    }
    println!("Session");
    println!("  idle timeout:    {} s", config.session.idle_timeout_secs);
    println!("Credits");
    println!("  ledger:          {:?}", config.credits.ledger);
    println!("Auth");
    println!("  JWT secret:      {}", config.auth.jwt_secret.as_ref().map(|_| "configured").unwrap_or("not configured"));
    println!("Server");
    println!("  bind:            {}:{}", config.server.host, config.server.port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_capture_constants() {
        let config = Config::default();
        assert_eq!(config.capture.poll_interval_ms, 100);
        assert_eq!(config.capture.speech_threshold_db, -40.0);
        assert_eq!(config.capture.min_recording_ms, 500);
        assert_eq!(config.capture.fallback_timeout_ms, 2500);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            mode = "stream"

            [realtime]
            dialect = "relay"
            endpoint = "ws://localhost:9000"

            [[tools.http]]
            name = "generate_image"
            description = "Generate an image"
            url = "http://localhost:7000/image"
            cost = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.realtime.dialect, Dialect::Relay);
        assert_eq!(config.capture.mode, CaptureMode::Stream);
        assert_eq!(config.capture.max_utterance_ms, 30_000);
        assert_eq!(config.realtime.voice, "alloy");
        assert_eq!(config.tools.http[0].cost, 5);
        assert_eq!(config.session.idle_timeout_secs, 120);
    }

    #[test]
    fn test_endpoint_carries_configured_model() {
        let mut realtime = RealtimeConfig::default();
        assert_eq!(realtime.endpoint_url().unwrap().as_str(), "wss://api.openai.com/v1/realtime?model=gpt-realtime");

        realtime.model = "gpt-realtime-mini".into();
        realtime.endpoint = "wss://relay.test/v1?region=eu&model=old".into();
        let url = realtime.endpoint_url().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(
            pairs,
            vec![("region".to_string(), "eu".to_string()), ("model".to_string(), "gpt-realtime-mini".to_string())]
        );

        realtime.model.clear();
        assert_eq!(realtime.endpoint_url().unwrap().as_str(), "wss://relay.test/v1?region=eu&model=old");
        realtime.endpoint = "not a url".into();
        assert!(realtime.endpoint_url().is_err());
    }

    #[test]
    fn test_load_from_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 8080);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.realtime.model, config.realtime.model);
    }
}
