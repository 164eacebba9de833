// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub length_secs: f64,
    pub overlap_secs: f64,
    /// Trailing segments shorter than this are not emitted.
    pub min_segment_secs: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            length_secs: 30.0,
            overlap_secs: 0.0,
            min_segment_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub min_confidence: f64,
    /// Keep matches scored exactly 0. Off by default.
    pub keep_zero_confidence: bool,
    pub time_threshold_secs: f64,
    /// Maximum number of separate occurrences of one track; 0 disables the cap.
    pub max_duplicates: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            keep_zero_confidence: false,
            time_threshold_secs: 60.0,
            max_duplicates: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests_per_minute: f64,
    /// Bucket capacity. Defaults to the per-minute rate when unset.
    pub burst: Option<u32>,
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_minute: 60.0,
            burst: None,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
    /// Directory for the on-disk tier. Memory only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 86_400,
            max_entries: 10_000,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: Option<u64>,
    pub attempt_timeout_secs: Option<u64>,
    pub overall_timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: Some(10_000),
            attempt_timeout_secs: Some(10),
            overall_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Stop at the first recognizer that reports a match.
    #[default]
    FirstMatch,
    /// Query every recognizer for every segment.
    AllProviders,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub concurrency: usize,
    pub run_timeout_secs: Option<u64>,
    pub best_effort: bool,
    pub recognition_mode: RecognitionMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_timeout_secs: None,
            best_effort: true,
            recognition_mode: RecognitionMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcrCloudConfig {
    pub access_key: String,
    pub access_secret: String,
    pub host: String,
    pub timeout_secs: u64,
    /// Bumped whenever the account or project changes so cached answers are not reused.
    pub config_version: String,
}

impl Default for AcrCloudConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            access_secret: String::new(),
            host: "identify-eu-west-1.acrcloud.com".to_string(),
            timeout_secs: 10,
            config_version: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub acrcloud: Option<AcrCloudConfig>,
    pub spotify: Option<SpotifyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub formats: Vec<String>,
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            formats: vec!["json".to_string()],
            directory: PathBuf::from("tracklists"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub segment: SegmentConfig,
    pub matching: MatchingConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub providers: ProvidersConfig,
    pub output: OutputConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let segment = &self.segment;
        if segment.length_secs.is_nan() || segment.length_secs <= 0.0 {
            bail!("segment.length_secs must be positive, got {}", segment.length_secs);
        }
        if segment.overlap_secs < 0.0 || segment.overlap_secs >= segment.length_secs {
            bail!(
                "segment.overlap_secs must be in [0, {}), got {}",
                segment.length_secs,
                segment.overlap_secs
            );
        }
        if segment.min_segment_secs < 0.0 {
            bail!("segment.min_segment_secs must not be negative");
        }
        if !(0.0..=100.0).contains(&self.matching.min_confidence) {
            bail!(
                "matching.min_confidence must be in [0, 100], got {}",
                self.matching.min_confidence
            );
        }
        if self.matching.time_threshold_secs < 0.0 {
            bail!("matching.time_threshold_secs must not be negative");
        }
        if self.dispatch.concurrency == 0 {
            bail!("dispatch.concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            bail!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            );
        }
        Ok(())
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: CUEPOINT_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("CUEPOINT_").split("__"));

    let config: AppConfig = figment.extract()?;
    config.validate()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.segment.length_secs, 30.0);
        assert_eq!(config.matching.max_duplicates, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.dispatch.recognition_mode, RecognitionMode::FirstMatch);
    }

    #[test]
    fn toml_file_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cuepoint.toml",
                r#"
                [segment]
                length_secs = 20.0
                overlap_secs = 5.0

                [dispatch]
                recognition_mode = "all_providers"

                [providers.acrcloud]
                access_key = "key"
                access_secret = "secret"
                host = "identify-us-west-2.acrcloud.com"
                timeout_secs = 5
                config_version = "2"
                "#,
            )?;
            jail.set_env("CUEPOINT_MATCHING__MIN_CONFIDENCE", "70");

            let config = load(Some(Path::new("cuepoint.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.segment.length_secs, 20.0);
            assert_eq!(config.segment.overlap_secs, 5.0);
            assert_eq!(config.matching.min_confidence, 70.0);
            assert_eq!(
                config.dispatch.recognition_mode,
                RecognitionMode::AllProviders
            );
            let acr = config.providers.acrcloud.expect("acrcloud section");
            assert_eq!(acr.access_key, "key");
            assert_eq!(acr.config_version, "2");
            Ok(())
        });
    }

    #[test]
    fn provider_sections_only_need_credentials() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cuepoint.toml",
                r#"
                [providers.acrcloud]
                access_key = "key"
                access_secret = "secret"
                "#,
            )?;
            jail.set_env("CUEPOINT_PROVIDERS__SPOTIFY__CLIENT_ID", "id");
            jail.set_env("CUEPOINT_PROVIDERS__SPOTIFY__CLIENT_SECRET", "shh");

            let config = load(Some(Path::new("cuepoint.toml"))).map_err(|e| e.to_string())?;
            let acr = config.providers.acrcloud.expect("acrcloud section");
            assert_eq!(acr.access_key, "key");
            assert_eq!(acr.host, "identify-eu-west-1.acrcloud.com");
            assert_eq!(acr.timeout_secs, 10);
            assert_eq!(acr.config_version, "1");
            let spotify = config.providers.spotify.expect("spotify section");
            assert_eq!(spotify.client_id, "id");
            assert_eq!(spotify.client_secret, "shh");
            Ok(())
        });
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let mut config = AppConfig::default();
        config.segment.overlap_secs = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn confidence_floor_out_of_range_is_rejected() {
        let mut config = AppConfig::default();
        config.matching.min_confidence = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
