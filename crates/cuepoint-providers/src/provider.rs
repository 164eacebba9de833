// SPDX-License-Identifier: GPL-3.0-or-later

use cuepoint_domain::{AudioSegment, Enrichment, RawMatch, Recognition};

use crate::Result;

/// A configured external service. Capabilities are discovered, not assumed.
pub trait Provider: Send + Sync {
    /// Stable identifier, used in match provenance and cache keys.
    fn id(&self) -> &str;

    /// Changes whenever the provider's account or settings change, so cached
    /// answers from an older configuration are never reused.
    fn config_version(&self) -> &str {
        "1"
    }

    fn as_recognizer(&self) -> Option<&dyn Recognizer> {
        None
    }

    fn as_enricher(&self) -> Option<&dyn Enricher> {
        None
    }
}

/// Identifies the track playing in a segment.
#[async_trait::async_trait]
pub trait Recognizer: Provider {
    /// `Ok(None)` means the provider answered but found nothing.
    async fn identify(&self, segment: &AudioSegment) -> Result<Option<Recognition>>;
}

/// Supplies metadata for a match another provider produced.
#[async_trait::async_trait]
pub trait Enricher: Provider {
    async fn enrich(&self, partial: &RawMatch) -> Result<Enrichment>;
}
