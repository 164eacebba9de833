// SPDX-License-Identifier: GPL-3.0-or-later

//! Drives segments through the configured providers.
//!
//! Segments are pulled lazily from a [`Segmenter`] and processed concurrently.
//! Every provider call goes through the shared [`RateLimiter`], the
//! [`ResponseCache`] and the [`RetryExecutor`]. Results are re-sorted before
//! they reach the [`TrackMatcher`], so completion order never leaks into the
//! tracklist.

use std::collections::HashSet;
use std::future::ready;
use std::time::{Duration, Instant};

use cuepoint_audio::{AudioError, DecodedAudio, SegmentOptions, Segmenter};
use cuepoint_config::{AppConfig, RecognitionMode};
use cuepoint_domain::{
    AudioSegment, Enrichment, RawMatch, Recognition, SegmentOutcome, SegmentStatus, Track,
};
use cuepoint_providers::{Enricher, ProviderError, ProviderRegistry, Recognizer};
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{fingerprint, ResponseCache};
use crate::matcher::TrackMatcher;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryError, RetryExecutor};

#[derive(Debug, Error)]
pub enum IdentificationError {
    #[error("invalid source: {0}")]
    InvalidSource(#[from] AudioError),

    #[error("provider {provider} is unavailable: {source}")]
    ProviderUnavailable {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("identification cancelled")]
    Cancelled,

    #[error("identification timed out after {0:?}")]
    TimedOut(Duration),
}

pub type Result<T> = std::result::Result<T, IdentificationError>;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Segments in flight at once.
    pub concurrency: usize,
    /// Longest wait for a rate limiter token. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    /// Return partial results when interrupted instead of an error.
    pub best_effort: bool,
    pub recognition_mode: RecognitionMode,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            acquire_timeout: Some(Duration::from_secs(30)),
            run_timeout: None,
            best_effort: true,
            recognition_mode: RecognitionMode::FirstMatch,
        }
    }
}

impl DispatchOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.dispatch.concurrency.max(1),
            acquire_timeout: Some(Duration::from_secs(config.rate_limit.acquire_timeout_secs)),
            run_timeout: config.dispatch.run_timeout_secs.map(Duration::from_secs),
            best_effort: config.dispatch.best_effort,
            recognition_mode: config.dispatch.recognition_mode,
        }
    }
}

/// Everything the providers said about one source, before merging.
#[derive(Debug, Clone, Default)]
pub struct SegmentResults {
    /// Ordered by mix offset, then sequence index.
    pub matches: Vec<RawMatch>,
    /// One per segment, ordered by sequence index.
    pub outcomes: Vec<SegmentOutcome>,
    /// Cancellation or the run timeout stopped dispatch early.
    pub interrupted: bool,
}

impl SegmentResults {
    pub fn gaps(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_gap()).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tracklist {
    pub tracks: Vec<Track>,
    pub outcomes: Vec<SegmentOutcome>,
    /// Provider records discarded by validation.
    pub rejected: usize,
    pub interrupted: bool,
}

impl Tracklist {
    /// Segments whose provider calls failed.
    pub fn gap_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_gap()).count()
    }

    pub fn segments_total(&self) -> usize {
        self.outcomes.len()
    }
}

/// Result of processing one segment.
#[derive(Debug)]
struct SegmentReport {
    matches: Vec<RawMatch>,
    outcome: SegmentOutcome,
}

/// Why one provider call produced no answer.
enum CallError {
    Cancelled,
    Failed(String),
    Unavailable {
        provider: String,
        source: ProviderError,
    },
}

pub struct IdentificationOrchestrator {
    registry: ProviderRegistry,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    retry: RetryExecutor,
    matcher: TrackMatcher,
    options: DispatchOptions,
}

impl IdentificationOrchestrator {
    /// No throttling, no caching and the default retry policy until configured.
    pub fn new(registry: ProviderRegistry, matcher: TrackMatcher) -> Self {
        Self {
            registry,
            rate_limiter: RateLimiter::disabled(),
            cache: ResponseCache::disabled(),
            retry: RetryExecutor::default(),
            matcher,
            options: DispatchOptions::default(),
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Segment `audio`, identify every segment and merge the matches.
    pub async fn run(
        &self,
        source_id: &str,
        audio: DecodedAudio,
        segment_options: SegmentOptions,
        cancel: &CancellationToken,
    ) -> Result<Tracklist> {
        let segmenter = Segmenter::new(source_id, audio, segment_options)?;
        self.run_segments(&segmenter, cancel).await
    }

    /// Identify and merge an already prepared source.
    pub async fn run_segments(
        &self,
        segmenter: &Segmenter,
        cancel: &CancellationToken,
    ) -> Result<Tracklist> {
        let started = Instant::now();
        let results = self.identify(segmenter, cancel).await?;
        let gaps = results.gaps();
        let merged = self.matcher.merge(results.matches);

        info!(
            target: "orchestrator",
            source = segmenter.source_id(),
            segments = results.outcomes.len(),
            tracks = merged.tracks.len(),
            gaps,
            rejected = merged.rejected.len(),
            interrupted = results.interrupted,
            elapsed = ?started.elapsed(),
            "identification finished"
        );

        Ok(Tracklist {
            tracks: merged.tracks,
            outcomes: results.outcomes,
            rejected: merged.rejected.len(),
            interrupted: results.interrupted,
        })
    }

    #[instrument(skip(self, segmenter, cancel), fields(source = segmenter.source_id()))]
    pub async fn identify(
        &self,
        segmenter: &Segmenter,
        cancel: &CancellationToken,
    ) -> Result<SegmentResults> {
        let total = segmenter.len();
        info!(
            target: "orchestrator",
            segments = total,
            concurrency = self.options.concurrency,
            providers = ?self.registry.ids(),
            "starting identification"
        );

        let run_token = cancel.child_token();
        let timer = async {
            match self.options.run_timeout {
                Some(limit) => sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);
        let mut timed_out = false;

        let token = &run_token;
        let mut pending = stream::iter(segmenter.segments())
            .take_while(move |_| ready(!token.is_cancelled()))
            .map(move |item| async move {
                let segment = item?;
                self.process_segment(segment, token).await
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut matches = Vec::new();
        let mut outcomes = Vec::with_capacity(total);
        loop {
            tokio::select! {
                _ = &mut timer, if !timed_out => {
                    timed_out = true;
                    warn!(target: "orchestrator", limit = ?self.options.run_timeout, "run timeout reached, stopping dispatch");
                    run_token.cancel();
                }
                next = pending.next() => match next {
                    Some(report) => {
                        let report = report?;
                        debug!(
                            target: "orchestrator",
                            segment = report.outcome.sequence_index,
                            status = ?report.outcome.status,
                            matches = report.matches.len(),
                            "segment processed"
                        );
                        matches.extend(report.matches);
                        outcomes.push(report.outcome);
                    }
                    None => break,
                },
            }
        }
        drop(pending);

        let seen: HashSet<usize> = outcomes.iter().map(|o| o.sequence_index).collect();
        for index in (0..total).filter(|i| !seen.contains(i)) {
            if let Some((start, duration)) = segmenter.segment_bounds(index) {
                outcomes.push(SegmentOutcome {
                    sequence_index: index,
                    start_offset_secs: start,
                    duration_secs: duration,
                    status: SegmentStatus::Skipped,
                });
            }
        }

        let interrupted = outcomes
            .iter()
            .any(|o| o.status == SegmentStatus::Skipped);
        if interrupted {
            warn!(
                target: "orchestrator",
                skipped = outcomes.iter().filter(|o| o.status == SegmentStatus::Skipped).count(),
                timed_out,
                "identification interrupted"
            );
            if !self.options.best_effort {
                return Err(match (timed_out, self.options.run_timeout) {
                    (true, Some(limit)) => IdentificationError::TimedOut(limit),
                    _ => IdentificationError::Cancelled,
                });
            }
        }

        matches.sort_by(|a, b| {
            a.mix_offset_secs
                .total_cmp(&b.mix_offset_secs)
                .then(a.segment_sequence_index.cmp(&b.segment_sequence_index))
        });
        outcomes.sort_by_key(|o| o.sequence_index);

        Ok(SegmentResults {
            matches,
            outcomes,
            interrupted,
        })
    }

    async fn process_segment(
        &self,
        segment: AudioSegment,
        token: &CancellationToken,
    ) -> Result<SegmentReport> {
        let content_hash = segment.content_hash();
        let mut matches = Vec::new();
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for provider in self.registry.recognizers() {
            let Some(recognizer) = provider.as_recognizer() else {
                continue;
            };
            match self.recognize(recognizer, &segment, &content_hash, token).await {
                Ok(Some(recognition)) => {
                    matches.push(RawMatch::from_recognition(
                        recognizer.id(),
                        &segment,
                        recognition,
                    ));
                    if self.options.recognition_mode == RecognitionMode::FirstMatch {
                        break;
                    }
                }
                Ok(None) => {}
                Err(CallError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(CallError::Failed(reason)) => {
                    failure.get_or_insert(reason);
                }
                Err(CallError::Unavailable { provider, source }) => {
                    return Err(IdentificationError::ProviderUnavailable { provider, source });
                }
            }
        }

        for found in &mut matches {
            self.enrich(found, token).await;
        }

        let status = if !matches.is_empty() {
            SegmentStatus::Matched
        } else if cancelled {
            SegmentStatus::Skipped
        } else if let Some(reason) = failure {
            SegmentStatus::Failed(reason)
        } else {
            SegmentStatus::NoMatch
        };

        Ok(SegmentReport {
            outcome: SegmentOutcome::for_segment(&segment, status),
            matches,
        })
    }

    /// Rate limit, wait or stop when cancelled.
    async fn throttle(&self, token: &CancellationToken) -> std::result::Result<(), CallError> {
        let granted = tokio::select! {
            _ = token.cancelled() => return Err(CallError::Cancelled),
            granted = self.rate_limiter.acquire(self.options.acquire_timeout) => granted,
        };
        if granted {
            Ok(())
        } else {
            Err(CallError::Failed("rate limit wait timed out".to_string()))
        }
    }

    async fn recognize(
        &self,
        recognizer: &dyn Recognizer,
        segment: &AudioSegment,
        content_hash: &str,
        token: &CancellationToken,
    ) -> std::result::Result<Option<Recognition>, CallError> {
        let id = recognizer.id();
        self.throttle(token).await?;

        let key = fingerprint(id, recognizer.config_version(), content_hash);
        if let Some(cached) = self.cache.get_as::<Option<Recognition>>(&key) {
            debug!(
                target: "orchestrator",
                provider = id,
                segment = segment.sequence_index(),
                "cache hit"
            );
            return Ok(cached);
        }

        let label = format!("{}:identify:{}", id, segment.sequence_index());
        match self.retry.run(&label, || recognizer.identify(segment)).await {
            Ok(recognition) => {
                self.cache.put_as(&key, &recognition, self.cache.default_ttl());
                Ok(recognition)
            }
            Err(e) if e.is_authentication() => {
                warn!(target: "orchestrator", provider = id, error = %e, "provider rejected credentials");
                match e {
                    RetryError::NotRetryable { source, .. } | RetryError::Exceeded { last: source, .. } => {
                        Err(CallError::Unavailable {
                            provider: id.to_string(),
                            source,
                        })
                    }
                    other => Err(CallError::Failed(other.to_string())),
                }
            }
            Err(e) => {
                warn!(
                    target: "orchestrator",
                    provider = id,
                    segment = segment.sequence_index(),
                    error = %e,
                    "recognition failed"
                );
                Err(CallError::Failed(e.to_string()))
            }
        }
    }

    /// Fill in metadata from every enricher. Failures leave the match as is.
    async fn enrich(&self, found: &mut RawMatch, token: &CancellationToken) {
        for provider in self.registry.enrichers() {
            let Some(enricher) = provider.as_enricher() else {
                continue;
            };
            match self.enrichment_for(enricher, found, token).await {
                Ok(enrichment) => found.apply_enrichment(enrichment),
                Err(CallError::Cancelled) => return,
                Err(CallError::Failed(reason)) => {
                    warn!(
                        target: "orchestrator",
                        provider = enricher.id(),
                        track = %found.identity_key(),
                        %reason,
                        "enrichment failed"
                    );
                }
                Err(CallError::Unavailable { provider, source }) => {
                    warn!(
                        target: "orchestrator",
                        %provider,
                        error = %source,
                        "enrichment provider unavailable"
                    );
                }
            }
        }
    }

    async fn enrichment_for(
        &self,
        enricher: &dyn Enricher,
        partial: &RawMatch,
        token: &CancellationToken,
    ) -> std::result::Result<Enrichment, CallError> {
        let id = enricher.id();
        self.throttle(token).await?;

        let key = fingerprint(
            id,
            enricher.config_version(),
            &partial.identity_key().to_string(),
        );
        if let Some(cached) = self.cache.get_as::<Enrichment>(&key) {
            return Ok(cached);
        }

        let label = format!("{}:enrich:{}", id, partial.segment_sequence_index);
        match self.retry.run(&label, || enricher.enrich(partial)).await {
            Ok(enrichment) => {
                self.cache.put_as(&key, &enrichment, self.cache.default_ttl());
                Ok(enrichment)
            }
            Err(e) => Err(CallError::Failed(e.to_string())),
        }
    }
}

impl std::fmt::Debug for IdentificationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentificationOrchestrator")
            .field("registry", &self.registry)
            .field("rate_limiter", &self.rate_limiter)
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish()
    }
}
