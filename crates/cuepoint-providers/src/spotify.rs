// SPDX-License-Identifier: GPL-3.0-or-later

//! Spotify Web API metadata enrichment (client-credentials flow).

use std::sync::Arc;
use std::time::Duration;

use cuepoint_domain::{Enrichment, ExternalIds, RawMatch};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::provider::{Enricher, Provider};
use crate::{ProviderError, Result, USER_AGENT};

const PROVIDER_ID: &str = "spotify";
const API_BASE: &str = "https://api.spotify.com";
const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
/// Refresh tokens this long before Spotify says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: TrackPage,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: String,
    duration_ms: Option<u64>,
    album: Option<AlbumItem>,
    #[serde(default)]
    artists: Vec<ArtistItem>,
    #[serde(default)]
    external_ids: ExternalIdsItem,
    #[serde(default)]
    external_urls: ExternalUrlsItem,
}

#[derive(Debug, Deserialize)]
struct AlbumItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ArtistItem {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalIdsItem {
    isrc: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrlsItem {
    spotify: Option<String>,
}

impl TrackItem {
    fn into_enrichment(self) -> Enrichment {
        let mut external_ids = ExternalIds::new();
        external_ids.insert(PROVIDER_ID.to_string(), self.id);
        if let Some(url) = self.external_urls.spotify {
            external_ids.insert("spotify_url".to_string(), url);
        }
        if let Some(isrc) = self.external_ids.isrc {
            external_ids.insert("isrc".to_string(), isrc);
        }
        Enrichment {
            album: self.album.map(|a| a.name),
            artists: self.artists.into_iter().map(|a| a.name).collect(),
            external_ids,
            track_duration_secs: self.duration_ms.map(|ms| ms as f64 / 1000.0),
        }
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    client: Client,
    api_base: String,
    accounts_base: String,
    client_id: String,
    client_secret: String,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl SpotifyClient {
    pub fn builder(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> SpotifyClientBuilder {
        SpotifyClientBuilder::new(client_id, client_secret)
    }

    fn auth_error(message: impl Into<String>) -> ProviderError {
        ProviderError::Authentication {
            provider: PROVIDER_ID.to_string(),
            message: message.into(),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(cached) = token.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        let url = format!("{}/api/token", self.accounts_base);
        trace!(target: "spotify", "POST {}", url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        debug!(target: "spotify", "token response status: {}", status);
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(Self::auth_error("client credentials rejected"));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: "token request failed".to_string(),
            });
        }

        let body: TokenResponse = serde_json::from_str(&response.text().await?)?;
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *token = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }
}

impl Provider for SpotifyClient {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn as_enricher(&self) -> Option<&dyn Enricher> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Enricher for SpotifyClient {
    #[instrument(skip(self, partial), fields(title = %partial.title))]
    async fn enrich(&self, partial: &RawMatch) -> Result<Enrichment> {
        let token = self.access_token().await?;

        let mut query = format!("track:{}", partial.title);
        if let Some(artist) = partial.primary_artist() {
            query.push_str(&format!(" artist:{}", artist));
        }

        let mut url = Url::parse(&format!("{}/v1/search", self.api_base))
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("type", "track")
            .append_pair("limit", "1");

        trace!(target: "spotify", "GET {}", url);
        let response = self
            .client
            .get(url.as_str())
            .bearer_auth(&token)
            .send()
            .await?;

        let status = response.status();
        debug!(target: "spotify", "search response status: {}", status);
        match status {
            StatusCode::UNAUTHORIZED => {
                self.invalidate_token().await;
                return Err(Self::auth_error("access token rejected"));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(ProviderError::RateLimited {
                    provider: PROVIDER_ID.to_string(),
                    retry_after,
                });
            }
            s if !s.is_success() => {
                return Err(ProviderError::Api {
                    status: s.as_u16(),
                    message: response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string()),
                });
            }
            _ => {}
        }

        let body: SearchResponse = serde_json::from_str(&response.text().await?)?;
        Ok(body
            .tracks
            .items
            .into_iter()
            .next()
            .map(TrackItem::into_enrichment)
            .unwrap_or_default())
    }
}

#[derive(Debug)]
pub struct SpotifyClientBuilder {
    client_id: String,
    client_secret: String,
    api_base: String,
    accounts_base: String,
    timeout: Duration,
}

impl SpotifyClientBuilder {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: API_BASE.to_string(),
            accounts_base: ACCOUNTS_BASE.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Point both the Web API and the accounts service at `url` (useful for testing).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.api_base = url.clone();
        self.accounts_base = url;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SpotifyClient> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ProviderError::Configuration(
                "Spotify client id and secret are required".to_string(),
            ));
        }
        for base in [&self.api_base, &self.accounts_base] {
            Url::parse(base)
                .map_err(|e| ProviderError::Configuration(format!("invalid base URL: {}", e)))?;
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(SpotifyClient {
            client,
            api_base: self.api_base.trim_end_matches('/').to_string(),
            accounts_base: self.accounts_base.trim_end_matches('/').to_string(),
            client_id: self.client_id,
            client_secret: self.client_secret,
            token: Arc::new(Mutex::new(None)),
        })
    }
}
