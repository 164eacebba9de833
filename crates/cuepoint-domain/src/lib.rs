// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use uuid::Uuid;

/// Provider name to provider-specific identifier (track id, URL, ISRC, ...).
pub type ExternalIds = BTreeMap<String, String>;

// ============================================================================
// Audio
// ============================================================================

/// A fixed-duration slice of the source audio, positioned on the mix timeline.
///
/// Segments are immutable once built; the samples are mono 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    source_id: String,
    sequence_index: usize,
    start_offset_secs: f64,
    duration_secs: f64,
    sample_rate: u32,
    samples: Vec<i16>,
}

impl AudioSegment {
    pub fn new(
        source_id: impl Into<String>,
        sequence_index: usize,
        start_offset_secs: f64,
        duration_secs: f64,
        sample_rate: u32,
        samples: Vec<i16>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            sequence_index,
            start_offset_secs,
            duration_secs,
            sample_rate,
            samples,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    pub fn start_offset_secs(&self) -> f64 {
        self.start_offset_secs
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn end_offset_secs(&self) -> f64 {
        self.start_offset_secs + self.duration_secs
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// SHA-256 over the sample rate and the little-endian PCM bytes.
    ///
    /// Two segments with identical audio hash identically regardless of
    /// where they sit in the mix.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sample_rate.to_le_bytes());
        for sample in &self.samples {
            hasher.update(sample.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// Provider answers
// ============================================================================

/// What a recognizer reports for one segment, independent of its mix offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    /// Provider score on a 0-100 scale.
    pub score: f64,
    pub track_duration_secs: Option<f64>,
}

/// Extra fields an enricher can supply for an existing match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub album: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub track_duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("match for segment {sequence_index} has no title")]
    MissingTitle { sequence_index: usize },

    #[error("match for segment {sequence_index} has no primary artist")]
    MissingArtist { sequence_index: usize },

    #[error("match for segment {sequence_index} has confidence {value} outside [0, 100]")]
    ConfidenceOutOfRange { sequence_index: usize, value: f64 },
}

/// One provider's identification of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMatch {
    pub provider_id: String,
    pub segment_sequence_index: usize,
    pub mix_offset_secs: f64,
    pub segment_duration_secs: f64,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub confidence: f64,
    pub raw_duration_secs: Option<f64>,
}

impl RawMatch {
    pub fn from_recognition(
        provider_id: impl Into<String>,
        segment: &AudioSegment,
        recognition: Recognition,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            segment_sequence_index: segment.sequence_index(),
            mix_offset_secs: segment.start_offset_secs(),
            segment_duration_secs: segment.duration_secs(),
            title: recognition.title,
            artists: recognition.artists,
            album: recognition.album,
            external_ids: recognition.external_ids,
            confidence: recognition.score,
            raw_duration_secs: recognition.track_duration_secs,
        }
    }

    pub fn primary_artist(&self) -> Option<&str> {
        self.artists.first().map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let sequence_index = self.segment_sequence_index;
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle { sequence_index });
        }
        if self
            .primary_artist()
            .map_or(true, |artist| artist.trim().is_empty())
        {
            return Err(ValidationError::MissingArtist { sequence_index });
        }
        if !self.confidence.is_finite() || !(0.0..=100.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange {
                sequence_index,
                value: self.confidence,
            });
        }
        Ok(())
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.title, self.primary_artist().unwrap_or_default())
    }

    /// Fill in fields the recognizer left empty. Recognizer values are never overwritten.
    pub fn apply_enrichment(&mut self, enrichment: Enrichment) {
        if self.album.is_none() {
            self.album = enrichment.album;
        }
        if self.artists.is_empty() {
            self.artists = enrichment.artists;
        }
        for (provider, id) in enrichment.external_ids {
            self.external_ids.entry(provider).or_insert(id);
        }
        if self.raw_duration_secs.is_none() {
            self.raw_duration_secs = enrichment.track_duration_secs;
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Lowercased, accent-free, punctuation-free form used to compare titles and artists.
pub fn normalize_for_match(value: &str) -> String {
    value
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Words that introduce a guest credit once punctuation is stripped.
const CREDIT_MARKERS: [&str; 5] = ["feat", "ft", "featuring", "vs", "with"];

/// [`normalize_for_match`] with guest credits cut off: `"New Order feat. Arthur Baker"`
/// compares as `"new order"`. A marker in first position is kept as part of the name.
pub fn normalize_artist(value: &str) -> String {
    let normalized = normalize_for_match(value);
    let words: Vec<&str> = normalized.split(' ').collect();
    match words.iter().skip(1).position(|w| CREDIT_MARKERS.contains(w)) {
        Some(at) => words[..=at].join(" "),
        None => normalized,
    }
}

/// Normalized (title, primary artist) pair. Matches with equal keys are the same song.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub title: String,
    pub artist: String,
}

impl IdentityKey {
    pub fn new(title: &str, primary_artist: &str) -> Self {
        Self {
            title: normalize_for_match(title),
            artist: normalize_artist(primary_artist),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

// ============================================================================
// Tracklist
// ============================================================================

/// Audit reference from a merged track back to a contributing match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRef {
    pub provider_id: String,
    pub segment_sequence_index: usize,
    pub mix_offset_secs: f64,
    pub confidence: f64,
}

impl From<&RawMatch> for MatchRef {
    fn from(raw: &RawMatch) -> Self {
        Self {
            provider_id: raw.provider_id.clone(),
            segment_sequence_index: raw.segment_sequence_index,
            mix_offset_secs: raw.mix_offset_secs,
            confidence: raw.confidence,
        }
    }
}

/// A consolidated entry of the final tracklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub mix_start_secs: f64,
    pub mix_duration_secs: f64,
    pub confidence: f64,
    pub source_matches: Vec<MatchRef>,
    #[serde(default)]
    pub external_links: ExternalIds,
}

impl Track {
    pub fn primary_artist(&self) -> &str {
        self.artists.first().map(String::as_str).unwrap_or_default()
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.title, self.primary_artist())
    }

    pub fn mix_end_secs(&self) -> f64 {
        self.mix_start_secs + self.mix_duration_secs
    }

    /// Start position formatted as `HH:MM:SS`.
    pub fn time_in_mix(&self) -> String {
        format_timestamp(self.mix_start_secs)
    }

    pub fn overlaps_with(&self, other: &Track) -> bool {
        self.mix_start_secs < other.mix_end_secs() && other.mix_start_secs < self.mix_end_secs()
    }

    /// Silence between the end of this track and the start of `next`; `None` when they overlap.
    pub fn gap_to(&self, next: &Track) -> Option<f64> {
        if self.overlaps_with(next) {
            return None;
        }
        Some(next.mix_start_secs - self.mix_end_secs())
    }

    /// Artist credit joined for display.
    pub fn artist_credit(&self) -> String {
        self.artists.join(", ")
    }
}

pub fn format_timestamp(secs: f64) -> String {
    let total = secs.max(0.0).floor() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SegmentStatus {
    Matched,
    NoMatch,
    Failed(String),
    /// Never dispatched because the run was cancelled or aborted.
    Skipped,
}

/// Per-segment bookkeeping so gaps can be reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub sequence_index: usize,
    pub start_offset_secs: f64,
    pub duration_secs: f64,
    pub status: SegmentStatus,
}

impl SegmentOutcome {
    pub fn for_segment(segment: &AudioSegment, status: SegmentStatus) -> Self {
        Self {
            sequence_index: segment.sequence_index(),
            start_offset_secs: segment.start_offset_secs(),
            duration_secs: segment.duration_secs(),
            status,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self.status, SegmentStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub source_title: String,
    pub source_path: Option<PathBuf>,
    pub analyzed_at: DateTime<Utc>,
    pub source_duration_secs: f64,
}

impl RunMetadata {
    pub fn new(source_title: impl Into<String>, source_duration_secs: f64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_title: source_title.into(),
            source_path: None,
            analyzed_at: Utc::now(),
            source_duration_secs,
        }
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}
