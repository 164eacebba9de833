// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use cuepoint_config::ProvidersConfig;
use tracing::info;

use crate::provider::Provider;
use crate::{AcrCloudClient, ProviderError, Result, SpotifyClient};

/// Providers in registration order. Recognizers are consulted in that order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every provider that has a configuration section.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(acr) = &config.acrcloud {
            let client = AcrCloudClient::builder(&acr.access_key, &acr.access_secret)
                .host(&acr.host)
                .timeout(Duration::from_secs(acr.timeout_secs))
                .config_version(&acr.config_version)
                .build()?;
            registry.register(Arc::new(client));
        }

        if let Some(spotify) = &config.spotify {
            let client = SpotifyClient::builder(&spotify.client_id, &spotify.client_secret).build()?;
            registry.register(Arc::new(client));
        }

        if registry.recognizers().next().is_none() {
            return Err(ProviderError::Configuration(
                "no recognition provider configured".to_string(),
            ));
        }

        info!(
            target: "providers",
            providers = ?registry.ids(),
            "provider registry ready"
        );
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub fn recognizers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().filter(|p| p.as_recognizer().is_some())
    }

    pub fn enrichers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().filter(|p| p.as_enricher().is_some())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuepoint_config::{AcrCloudConfig, SpotifyConfig};

    fn acr_config() -> AcrCloudConfig {
        AcrCloudConfig {
            access_key: "key".to_string(),
            access_secret: "secret".to_string(),
            ..AcrCloudConfig::default()
        }
    }

    #[test]
    fn builds_configured_providers_in_order() {
        let config = ProvidersConfig {
            acrcloud: Some(acr_config()),
            spotify: Some(SpotifyConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
            }),
        };

        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.ids(), vec!["acrcloud", "spotify"]);
        assert_eq!(registry.recognizers().count(), 1);
        assert_eq!(registry.enrichers().count(), 1);
        assert_eq!(registry.get("spotify").unwrap().id(), "spotify");
    }

    #[test]
    fn requires_a_recognizer() {
        let config = ProvidersConfig {
            acrcloud: None,
            spotify: Some(SpotifyConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
            }),
        };
        assert!(matches!(
            ProviderRegistry::from_config(&config),
            Err(ProviderError::Configuration(_))
        ));
    }
}
