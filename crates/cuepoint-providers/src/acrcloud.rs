// SPDX-License-Identifier: GPL-3.0-or-later

//! ACRCloud audio recognition.
//!
//! Requests are signed with HMAC-SHA1 over the method, endpoint, access key,
//! data type, signature version and timestamp, then sent as a multipart form
//! carrying the segment as a WAV file.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cuepoint_audio::encode_wav;
use cuepoint_domain::{AudioSegment, ExternalIds, Recognition};
use hmac::{Hmac, Mac};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::provider::{Provider, Recognizer};
use crate::{ProviderError, Result, USER_AGENT};

const PROVIDER_ID: &str = "acrcloud";
const DEFAULT_HOST: &str = "identify-eu-west-1.acrcloud.com";
const ENDPOINT: &str = "/v1/identify";
const DATA_TYPE: &str = "audio";
const SIGNATURE_VERSION: &str = "1";

const STATUS_SUCCESS: i64 = 0;
const STATUS_NO_RESULT: i64 = 1001;
const STATUS_INVALID_KEY: i64 = 3001;
const STATUS_LIMIT_EXCEEDED: i64 = 3003;
const STATUS_INVALID_SIGNATURE: i64 = 3014;
const STATUS_QPS_LIMIT: i64 = 3015;

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    status: ResponseStatus,
    #[serde(default)]
    metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    music: Vec<MusicEntry>,
}

#[derive(Debug, Deserialize)]
struct MusicEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    artists: Vec<NamedEntity>,
    album: Option<NamedEntity>,
    #[serde(default)]
    score: f64,
    duration_ms: Option<u64>,
    acrid: Option<String>,
    #[serde(default)]
    external_ids: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    external_metadata: ExternalMetadata,
}

#[derive(Debug, Deserialize)]
struct NamedEntity {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalMetadata {
    spotify: Option<SpotifyRef>,
}

#[derive(Debug, Deserialize)]
struct SpotifyRef {
    track: Option<SpotifyTrackRef>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrackRef {
    id: String,
}

impl MusicEntry {
    fn into_recognition(self) -> Recognition {
        let mut external_ids = ExternalIds::new();
        if let Some(acrid) = self.acrid.filter(|id| !id.is_empty()) {
            external_ids.insert(PROVIDER_ID.to_string(), acrid);
        }
        if let Some(isrc) = self.external_ids.get("isrc").and_then(|v| v.as_str()) {
            external_ids.insert("isrc".to_string(), isrc.to_string());
        }
        if let Some(track) = self.external_metadata.spotify.and_then(|s| s.track) {
            external_ids.insert("spotify".to_string(), track.id);
        }

        Recognition {
            title: self.title,
            artists: self.artists.into_iter().map(|a| a.name).collect(),
            album: self.album.map(|a| a.name).filter(|name| !name.is_empty()),
            external_ids,
            score: self.score.clamp(0.0, 100.0),
            track_duration_secs: self.duration_ms.map(|ms| ms as f64 / 1000.0),
        }
    }
}

/// Base64 HMAC-SHA1 of `payload` keyed with the account secret.
pub(crate) fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Configuration(format!("invalid ACRCloud secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn string_to_sign(access_key: &str, timestamp: i64) -> String {
    format!(
        "POST\n{}\n{}\n{}\n{}\n{}",
        ENDPOINT, access_key, DATA_TYPE, SIGNATURE_VERSION, timestamp
    )
}

#[derive(Debug, Clone)]
pub struct AcrCloudClient {
    client: Client,
    endpoint: String,
    access_key: String,
    access_secret: String,
    config_version: String,
}

impl AcrCloudClient {
    pub fn builder(
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> AcrCloudClientBuilder {
        AcrCloudClientBuilder::new(access_key, access_secret)
    }

    fn auth_error(message: impl Into<String>) -> ProviderError {
        ProviderError::Authentication {
            provider: PROVIDER_ID.to_string(),
            message: message.into(),
        }
    }

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited {
            provider: PROVIDER_ID.to_string(),
            retry_after: None,
        }
    }

    fn interpret(body: IdentifyResponse) -> Result<Option<Recognition>> {
        match body.status.code {
            STATUS_SUCCESS => Ok(body
                .metadata
                .and_then(|m| m.music.into_iter().next())
                .map(MusicEntry::into_recognition)),
            STATUS_NO_RESULT => Ok(None),
            STATUS_INVALID_KEY | STATUS_INVALID_SIGNATURE => {
                Err(Self::auth_error(body.status.msg))
            }
            STATUS_LIMIT_EXCEEDED | STATUS_QPS_LIMIT => Err(Self::rate_limited()),
            code => Err(ProviderError::InvalidResponse(format!(
                "ACRCloud status {}: {}",
                code, body.status.msg
            ))),
        }
    }
}

impl Provider for AcrCloudClient {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn config_version(&self) -> &str {
        &self.config_version
    }

    fn as_recognizer(&self) -> Option<&dyn Recognizer> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Recognizer for AcrCloudClient {
    #[instrument(skip(self, segment), fields(sequence_index = segment.sequence_index()))]
    async fn identify(&self, segment: &AudioSegment) -> Result<Option<Recognition>> {
        let sample = encode_wav(segment)
            .map_err(|e| ProviderError::InvalidResponse(format!("cannot encode sample: {}", e)))?;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign(
            &self.access_secret,
            &string_to_sign(&self.access_key, timestamp),
        )?;

        let form = Form::new()
            .text("access_key", self.access_key.clone())
            .text("sample_bytes", sample.len().to_string())
            .text("timestamp", timestamp.to_string())
            .text("signature", signature)
            .text("data_type", DATA_TYPE)
            .text("signature_version", SIGNATURE_VERSION)
            .part(
                "sample",
                Part::bytes(sample)
                    .file_name("sample.wav")
                    .mime_str("audio/wav")?,
            );

        trace!(target: "acrcloud", "POST {}", self.endpoint);
        let response = self.client.post(&self.endpoint).multipart(form).send().await?;

        let status = response.status();
        debug!(target: "acrcloud", "response status: {}", status);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Self::auth_error("invalid ACRCloud credentials"))
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(Self::rate_limited()),
            s if !s.is_success() => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ProviderError::Api {
                    status: s.as_u16(),
                    message,
                });
            }
            _ => {}
        }

        let body = response.text().await?;
        trace!(target: "acrcloud", "response: {}", body);
        Self::interpret(serde_json::from_str(&body)?)
    }
}

#[derive(Debug)]
pub struct AcrCloudClientBuilder {
    access_key: String,
    access_secret: String,
    base_url: String,
    timeout: Duration,
    config_version: String,
}

impl AcrCloudClientBuilder {
    pub fn new(access_key: impl Into<String>, access_secret: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            access_secret: access_secret.into(),
            base_url: format!("https://{}", DEFAULT_HOST),
            timeout: Duration::from_secs(10),
            config_version: "1".to_string(),
        }
    }

    /// Regional identify host, e.g. `identify-us-west-2.acrcloud.com`.
    pub fn host(mut self, host: impl AsRef<str>) -> Self {
        self.base_url = format!("https://{}", host.as_ref());
        self
    }

    /// Set a custom base URL (useful for testing).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config_version(mut self, version: impl Into<String>) -> Self {
        self.config_version = version.into();
        self
    }

    pub fn build(self) -> Result<AcrCloudClient> {
        if self.access_key.is_empty() || self.access_secret.is_empty() {
            return Err(ProviderError::Configuration(
                "ACRCloud access key and secret are required".to_string(),
            ));
        }
        let base = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Configuration(format!("invalid base URL: {}", e)))?;
        let endpoint = base
            .join(ENDPOINT)
            .map_err(|e| ProviderError::Configuration(format!("invalid base URL: {}", e)))?;

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(AcrCloudClient {
            client,
            endpoint: endpoint.to_string(),
            access_key: self.access_key,
            access_secret: self.access_secret,
            config_version: self.config_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment() -> AudioSegment {
        AudioSegment::new("mix", 4, 120.0, 1.0, 8000, vec![0; 8000])
    }

    async fn client_for(server: &MockServer) -> AcrCloudClient {
        AcrCloudClient::builder("test-key", "test-secret")
            .base_url(server.uri())
            .build()
            .unwrap()
    }

    fn match_response() -> serde_json::Value {
        serde_json::json!({
            "status": {"msg": "Success", "code": 0, "version": "1.0"},
            "metadata": {
                "music": [{
                    "title": "Blue Monday",
                    "artists": [{"name": "New Order"}],
                    "album": {"name": "Power, Corruption & Lies"},
                    "score": 92,
                    "duration_ms": 448000,
                    "acrid": "6049f11da7095e8bb8266871d4a70873",
                    "external_ids": {"isrc": "GBAAP0000005"},
                    "external_metadata": {"spotify": {"track": {"id": "5hNs6j9MFFxM3s9Ki3SpxK"}}}
                }]
            }
        })
    }

    #[test]
    fn signature_matches_reference_hmac() {
        // HMAC-SHA1("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            sign("key", "The quick brown fox jumps over the lazy dog").unwrap(),
            "3nybhbi3iqa8ino29wqQcBydtNk="
        );
        assert_eq!(
            string_to_sign("abc", 1_700_000_000),
            "POST\n/v1/identify\nabc\naudio\n1\n1700000000"
        );
    }

    #[tokio::test]
    async fn identify_maps_first_music_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .and(body_string_contains("test-key"))
            .and(body_string_contains("signature_version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(match_response()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let recognition = client.identify(&segment()).await.unwrap().unwrap();

        assert_eq!(recognition.title, "Blue Monday");
        assert_eq!(recognition.artists, vec!["New Order".to_string()]);
        assert_eq!(recognition.album.as_deref(), Some("Power, Corruption & Lies"));
        assert_eq!(recognition.score, 92.0);
        assert_eq!(recognition.track_duration_secs, Some(448.0));
        assert_eq!(recognition.external_ids["isrc"], "GBAAP0000005");
        assert_eq!(recognition.external_ids["spotify"], "5hNs6j9MFFxM3s9Ki3SpxK");
        assert!(recognition.external_ids.contains_key("acrcloud"));
    }

    #[tokio::test]
    async fn no_result_status_is_no_match() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"msg": "No result", "code": 1001, "version": "1.0"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.identify(&segment()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_key_status_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"msg": "Invalid access key", "code": 3001, "version": "1.0"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.identify(&segment()).await.unwrap_err();
        assert!(err.is_authentication());
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(matches!(
            client.identify(&segment()).await.unwrap_err(),
            ProviderError::RateLimited { .. }
        ));
        match client.identify(&segment()).await.unwrap_err() {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(matches!(
            client.identify(&segment()).await.unwrap_err(),
            ProviderError::InvalidResponse(_)
        ));
    }

    #[test]
    fn builder_requires_credentials_and_valid_url() {
        assert!(AcrCloudClient::builder("", "secret").build().is_err());
        assert!(AcrCloudClient::builder("key", "secret")
            .base_url("not a url")
            .build()
            .is_err());
        let client = AcrCloudClient::builder("key", "secret")
            .host("identify-us-west-2.acrcloud.com")
            .config_version("7")
            .build()
            .unwrap();
        assert_eq!(client.endpoint, "https://identify-us-west-2.acrcloud.com/v1/identify");
        assert_eq!(client.config_version(), "7");
        assert!(client.as_recognizer().is_some());
        assert!(client.as_enricher().is_none());
    }
}
