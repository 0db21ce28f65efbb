//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! Environment keys use a double underscore between the section and the
//! field, so snake_case field names survive the mapping:
//! `APP_MODELS__WHISPER_MODEL` targets `models.whisper_model`.
//!
//! The diarization credential is special: it is a secret and is only ever
//! read from the environment (`DIARIZATION_AUTH_TOKEN`, falling back to
//! `HF_TOKEN`), never from a file checked into the repo.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_SERVER__PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub fetch: FetchConfig,
    pub diarization: DiarizationConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: only accept connections from localhost
/// - `host = "0.0.0.0"`: accept connections from any address (deployment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Recognition and alignment model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Whisper model variant ("tiny", "base", "small", "medium", "large-v2").
    pub whisper_model: String,

    /// Number of 30-second audio windows encoded per model pass. Affects
    /// throughput and memory only, never output content. Default 16.
    pub batch_size: usize,

    /// Compute device preference: "auto", "cpu", "cuda" or "metal".
    pub device: String,

    /// What to do when the detected language has no alignment model:
    /// "degrade" returns segment-level (unaligned) timestamps, "fatal"
    /// fails the whole request.
    pub alignment_failure: AlignmentFailurePolicy,

    /// Emit character-level spans inside aligned words. Off by default as
    /// a latency/precision trade-off.
    pub char_alignments: bool,
}

/// Policy for requests whose detected language cannot be aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentFailurePolicy {
    /// Return segment-level timestamps without word alignment.
    Degrade,
    /// Fail the request with an unsupported-language error.
    Fatal,
}

/// Audio fetch configuration. The fetch talks to an untrusted remote
/// endpoint, so it is the one stage with an explicit timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Overall timeout for downloading the source audio, seconds.
    pub timeout_secs: u64,

    /// Maximum accepted payload size in bytes.
    pub max_bytes: usize,
}

/// Diarization stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationConfig {
    /// Endpoint of the hosted diarization model.
    pub endpoint: String,

    /// Access credential for the diarization model. Environment-provided
    /// only; absence makes diarization-enabled requests fail with a
    /// configuration error before any audio is processed.
    #[serde(skip_serializing, default)]
    pub auth_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                whisper_model: "large-v2".to_string(),
                batch_size: 16,
                device: "auto".to_string(),
                alignment_failure: AlignmentFailurePolicy::Degrade,
                char_alignments: false,
            },
            fetch: FetchConfig {
                timeout_secs: 60,
                // 512 MiB, enough for roughly 4.5 hours of 16 kHz mono WAV.
                max_bytes: 512 * 1024 * 1024,
            },
            diarization: DiarizationConfig {
                endpoint: "https://api-inference.huggingface.co/models/pyannote/speaker-diarization-3.1".to_string(),
                auth_token: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: override server port
    /// - `APP_MODELS__WHISPER_MODEL=medium`: override whisper model
    /// - `HOST` / `PORT`: deployment-platform conventions, honored too
    /// - `DIARIZATION_AUTH_TOKEN` (or `HF_TOKEN`): diarization credential
    pub fn load() -> Result<Self> {
        // The section separator is a double underscore; a single one would
        // split snake_case field names like whisper_model apart.
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        // The credential is secret material and comes from the environment
        // only; a value smuggled in through config.toml is ignored.
        config.diarization.auth_token = env::var("DIARIZATION_AUTH_TOKEN")
            .or_else(|_| env::var("HF_TOKEN"))
            .ok()
            .filter(|token| !token.trim().is_empty());

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.fetch.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Fetch timeout must be greater than 0"));
        }

        if self.fetch.max_bytes == 0 {
            return Err(anyhow::anyhow!("Fetch size cap must be greater than 0"));
        }

        if self.diarization.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Diarization endpoint cannot be empty"));
        }

        Ok(())
    }

    /// Whether this process can serve diarization-enabled requests.
    pub fn diarization_available(&self) -> bool {
        self.diarization.auth_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.models.whisper_model, "large-v2");
        assert_eq!(config.models.batch_size, 16);
        assert!(!config.models.char_alignments);
        assert_eq!(
            config.models.alignment_failure,
            AlignmentFailurePolicy::Degrade
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fetch.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_diarization_availability() {
        let mut config = AppConfig::default();
        assert!(!config.diarization_available());
        config.diarization.auth_token = Some("hf_xxx".to_string());
        assert!(config.diarization_available());
    }

    #[test]
    fn test_env_override_reaches_snake_case_fields() {
        env::set_var("APP_MODELS__WHISPER_MODEL", "base");
        env::set_var("APP_FETCH__TIMEOUT_SECS", "30");

        let config = AppConfig::load().unwrap();

        env::remove_var("APP_MODELS__WHISPER_MODEL");
        env::remove_var("APP_FETCH__TIMEOUT_SECS");

        assert_eq!(config.models.whisper_model, "base");
        assert_eq!(config.fetch.timeout_secs, 30);
    }

    #[test]
    fn test_token_not_serialized() {
        let mut config = AppConfig::default();
        config.diarization.auth_token = Some("hf_secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hf_secret"));
    }
}
