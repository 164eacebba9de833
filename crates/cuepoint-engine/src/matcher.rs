// SPDX-License-Identifier: GPL-3.0-or-later

//! Consolidation of per-segment matches into a tracklist.
//!
//! Matches are validated, filtered by confidence, reduced to the best match per
//! segment, ordered on the mix timeline and grouped into clusters of the same
//! song. Each surviving cluster becomes one [`Track`].

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use cuepoint_config::MatchingConfig;
use cuepoint_domain::{
    normalize_for_match, ExternalIds, IdentityKey, MatchRef, RawMatch, Track, ValidationError,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MatcherOptions {
    pub min_confidence: f64,
    pub keep_zero_confidence: bool,
    /// Two matches of the same song closer than this belong to the same play.
    pub time_threshold_secs: f64,
    /// Separate plays of one song to keep; 0 keeps all of them.
    pub max_duplicates: usize,
    pub segment_length_secs: f64,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            keep_zero_confidence: false,
            time_threshold_secs: 60.0,
            max_duplicates: 2,
            segment_length_secs: 30.0,
        }
    }
}

impl MatcherOptions {
    pub fn from_config(config: &MatchingConfig, segment_length_secs: f64) -> Self {
        Self {
            min_confidence: config.min_confidence,
            keep_zero_confidence: config.keep_zero_confidence,
            time_threshold_secs: config.time_threshold_secs,
            max_duplicates: config.max_duplicates,
            segment_length_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub tracks: Vec<Track>,
    /// Records discarded at ingestion.
    pub rejected: Vec<ValidationError>,
}

/// One input to clustering: a raw match, or an already merged track.
#[derive(Debug, Clone)]
struct Candidate {
    key: IdentityKey,
    sequence_index: usize,
    offset: f64,
    /// Mix time covered from `offset`.
    coverage: f64,
    confidence: f64,
    title: String,
    artists: Vec<String>,
    album: Option<String>,
    external_ids: ExternalIds,
    refs: Vec<MatchRef>,
}

impl Candidate {
    fn from_raw(raw: RawMatch) -> Self {
        let refs = vec![MatchRef::from(&raw)];
        Self {
            key: raw.identity_key(),
            sequence_index: raw.segment_sequence_index,
            offset: raw.mix_offset_secs,
            coverage: raw.segment_duration_secs,
            confidence: raw.confidence,
            title: raw.title,
            artists: raw.artists,
            album: raw.album,
            external_ids: raw.external_ids,
            refs,
        }
    }

    fn from_track(track: Track) -> Self {
        let sequence_index = track
            .source_matches
            .iter()
            .map(|r| r.segment_sequence_index)
            .min()
            .unwrap_or(usize::MAX);
        Self {
            key: track.identity_key(),
            sequence_index,
            offset: track.mix_start_secs,
            coverage: track.mix_duration_secs,
            confidence: track.confidence,
            title: track.title,
            artists: track.artists,
            album: track.album,
            external_ids: track.external_links,
            refs: track.source_matches,
        }
    }
}

#[derive(Debug)]
struct Cluster {
    key: IdentityKey,
    members: Vec<Candidate>,
    last_offset: f64,
}

impl Cluster {
    fn open(candidate: Candidate) -> Self {
        Self {
            key: candidate.key.clone(),
            last_offset: candidate.offset,
            members: vec![candidate],
        }
    }

    fn start(&self) -> f64 {
        self.members[0].offset
    }

    fn end(&self, segment_length: f64) -> f64 {
        self.members
            .iter()
            .map(|m| m.offset + m.coverage.max(segment_length))
            .fold(f64::MIN, f64::max)
    }
}

#[derive(Debug, Clone)]
pub struct TrackMatcher {
    options: MatcherOptions,
}

impl Default for TrackMatcher {
    fn default() -> Self {
        Self::new(MatcherOptions::default())
    }
}

impl TrackMatcher {
    pub fn new(options: MatcherOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MatcherOptions {
        &self.options
    }

    /// Merge raw per-segment matches into an ordered tracklist.
    pub fn merge(&self, matches: Vec<RawMatch>) -> MergeOutcome {
        let total = matches.len();
        let mut rejected = Vec::new();
        let mut candidates = Vec::with_capacity(total);

        for raw in matches {
            match raw.validate() {
                Ok(()) => candidates.push(Candidate::from_raw(raw)),
                Err(e) => {
                    warn!(target: "matcher", provider = %raw.provider_id, error = %e, "discarding invalid match");
                    rejected.push(e);
                }
            }
        }

        let tracks = self.consolidate(candidates);
        debug!(
            target: "matcher",
            input = total,
            rejected = rejected.len(),
            tracks = tracks.len(),
            "merge complete"
        );
        MergeOutcome { tracks, rejected }
    }

    /// Run already merged tracks through the matcher again.
    ///
    /// Merging is idempotent: `remerge(merge(x).tracks) == merge(x).tracks`.
    pub fn remerge(&self, tracks: Vec<Track>) -> Vec<Track> {
        self.consolidate(tracks.into_iter().map(Candidate::from_track).collect())
    }

    fn accepts(&self, confidence: f64) -> bool {
        confidence >= self.options.min_confidence
            && (confidence > 0.0 || self.options.keep_zero_confidence)
    }

    fn consolidate(&self, candidates: Vec<Candidate>) -> Vec<Track> {
        let segment_length = self.options.segment_length_secs;
        let threshold = self.options.time_threshold_secs;

        // Best match per segment; earlier candidates win ties.
        let mut per_segment: BTreeMap<usize, Candidate> = BTreeMap::new();
        for candidate in candidates {
            if !self.accepts(candidate.confidence) {
                continue;
            }
            match per_segment.entry(candidate.sequence_index) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    if candidate.confidence > slot.get().confidence {
                        slot.insert(candidate);
                    }
                }
            }
        }

        let mut ordered: Vec<Candidate> = per_segment.into_values().collect();
        ordered.sort_by(|a, b| {
            a.offset
                .total_cmp(&b.offset)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });

        let mut clusters: Vec<Cluster> = Vec::new();
        let mut current: Option<Cluster> = None;
        for candidate in ordered {
            match current.as_mut() {
                Some(cluster)
                    if cluster.key == candidate.key
                        && candidate.offset - cluster.last_offset <= threshold =>
                {
                    cluster.last_offset = candidate.offset;
                    cluster.members.push(candidate);
                }
                _ => {
                    if let Some(done) = current.replace(Cluster::open(candidate)) {
                        clusters.push(done);
                    }
                }
            }
        }
        clusters.extend(current);

        // Occurrence number and end of the latest play, per song.
        let mut plays: HashMap<IdentityKey, (usize, f64)> = HashMap::new();
        let mut tracks = Vec::new();
        for cluster in clusters {
            let start = cluster.start();
            let end = cluster.end(segment_length);
            let occurrence = match plays.get_mut(&cluster.key) {
                Some((occurrence, last_end)) => {
                    if start - *last_end > threshold {
                        *occurrence += 1;
                    }
                    *last_end = last_end.max(end);
                    *occurrence
                }
                None => {
                    plays.insert(cluster.key.clone(), (1, end));
                    1
                }
            };

            if self.options.max_duplicates > 0 && occurrence > self.options.max_duplicates {
                debug!(
                    target: "matcher",
                    track = %cluster.key,
                    occurrence,
                    start,
                    "dropping repeated track"
                );
                continue;
            }
            tracks.push(aggregate(cluster, start, end, segment_length));
        }

        tracks.sort_by(|a, b| {
            a.mix_start_secs
                .total_cmp(&b.mix_start_secs)
                .then(first_sequence(a).cmp(&first_sequence(b)))
        });
        tracks
    }
}

fn first_sequence(track: &Track) -> usize {
    track
        .source_matches
        .iter()
        .map(|r| r.segment_sequence_index)
        .min()
        .unwrap_or(usize::MAX)
}

fn aggregate(cluster: Cluster, start: f64, end: f64, segment_length: f64) -> Track {
    let members = cluster.members;
    let (lowest, highest) = members.iter().fold((f64::MAX, f64::MIN), |(lo, hi), m| {
        (lo.min(m.confidence), hi.max(m.confidence))
    });
    // Rounding must not push the mean outside the members' range.
    let confidence = (members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64)
        .clamp(lowest, highest);

    let best_index = members
        .iter()
        .enumerate()
        .fold(0, |best, (i, m)| {
            if m.confidence > members[best].confidence {
                i
            } else {
                best
            }
        });
    let best = &members[best_index];

    let mut seen = HashSet::new();
    let mut artists = Vec::new();
    let mut external_links = best.external_ids.clone();
    let mut album = best.album.clone();

    let rest = members
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best_index)
        .map(|(_, m)| m);
    for member in std::iter::once(best).chain(rest) {
        for artist in &member.artists {
            if seen.insert(normalize_for_match(artist)) {
                artists.push(artist.clone());
            }
        }
        if album.is_none() {
            album = member.album.clone();
        }
        for (provider, id) in &member.external_ids {
            external_links
                .entry(provider.clone())
                .or_insert_with(|| id.clone());
        }
    }

    let title = best.title.clone();
    let source_matches = members.into_iter().flat_map(|m| m.refs).collect();

    Track {
        title,
        artists,
        album,
        mix_start_secs: start,
        mix_duration_secs: (end - start).max(segment_length),
        confidence,
        source_matches,
        external_links,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seq: usize, offset: f64, title: &str, artist: &str, confidence: f64) -> RawMatch {
        RawMatch {
            provider_id: "acrcloud".to_string(),
            segment_sequence_index: seq,
            mix_offset_secs: offset,
            segment_duration_secs: 30.0,
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: None,
            external_ids: ExternalIds::new(),
            confidence,
            raw_duration_secs: None,
        }
    }

    fn blue_monday(seq: usize, offset: f64, confidence: f64) -> RawMatch {
        raw(seq, offset, "Blue Monday", "New Order", confidence)
    }

    #[test]
    fn consecutive_matches_of_one_song_merge_into_one_track() {
        let matcher = TrackMatcher::default();
        let outcome = matcher.merge(vec![
            blue_monday(0, 0.0, 80.0),
            blue_monday(1, 28.0, 85.0),
            blue_monday(2, 30.0, 90.0),
        ]);

        assert_eq!(outcome.tracks.len(), 1);
        let track = &outcome.tracks[0];
        assert_eq!(track.mix_start_secs, 0.0);
        assert!((track.confidence - 85.0).abs() < 1e-9);
        assert!(track.mix_duration_secs >= 60.0);
        assert_eq!(track.source_matches.len(), 3);
    }

    #[test]
    fn repeats_beyond_max_duplicates_are_dropped() {
        let matcher = TrackMatcher::new(MatcherOptions {
            max_duplicates: 2,
            ..MatcherOptions::default()
        });
        let outcome = matcher.merge(vec![
            blue_monday(0, 0.0, 90.0),
            blue_monday(16, 500.0, 90.0),
            blue_monday(33, 1000.0, 90.0),
        ]);

        let starts: Vec<f64> = outcome.tracks.iter().map(|t| t.mix_start_secs).collect();
        assert_eq!(starts, vec![0.0, 500.0]);
    }

    #[test]
    fn zero_max_duplicates_keeps_every_play() {
        let matcher = TrackMatcher::new(MatcherOptions {
            max_duplicates: 0,
            ..MatcherOptions::default()
        });
        let outcome = matcher.merge(vec![
            blue_monday(0, 0.0, 90.0),
            blue_monday(16, 500.0, 90.0),
            blue_monday(33, 1000.0, 90.0),
        ]);
        assert_eq!(outcome.tracks.len(), 3);
    }

    #[test]
    fn matches_below_the_floor_never_appear() {
        let matcher = TrackMatcher::new(MatcherOptions {
            min_confidence: 70.0,
            ..MatcherOptions::default()
        });
        let outcome = matcher.merge(vec![
            raw(0, 0.0, "Faint", "Someone", 10.0),
            raw(1, 30.0, "Strong", "Someone Else", 95.0),
        ]);

        assert_eq!(outcome.tracks.len(), 1);
        assert_eq!(outcome.tracks[0].title, "Strong");
    }

    #[test]
    fn zero_confidence_is_dropped_unless_requested() {
        let input = vec![raw(0, 0.0, "Silence", "Nobody", 0.0)];
        assert!(TrackMatcher::default().merge(input.clone()).tracks.is_empty());

        let keep = TrackMatcher::new(MatcherOptions {
            keep_zero_confidence: true,
            ..MatcherOptions::default()
        });
        assert_eq!(keep.merge(input).tracks.len(), 1);
    }

    #[test]
    fn empty_input_is_an_empty_tracklist() {
        let outcome = TrackMatcher::default().merge(Vec::new());
        assert!(outcome.tracks.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn invalid_records_are_rejected_and_the_rest_merged() {
        let outcome = TrackMatcher::default().merge(vec![
            raw(0, 0.0, "", "New Order", 90.0),
            blue_monday(1, 30.0, 90.0),
            raw(2, 60.0, "Ceremony", "New Order", 140.0),
        ]);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.tracks.len(), 1);
        assert_eq!(outcome.tracks[0].title, "Blue Monday");
    }

    #[test]
    fn best_match_per_segment_wins() {
        let mut other = raw(0, 0.0, "Confusion", "New Order", 95.0);
        other.provider_id = "second".to_string();
        let outcome = TrackMatcher::default().merge(vec![blue_monday(0, 0.0, 60.0), other]);

        assert_eq!(outcome.tracks.len(), 1);
        assert_eq!(outcome.tracks[0].title, "Confusion");
        assert_eq!(outcome.tracks[0].source_matches[0].provider_id, "second");
    }

    #[test]
    fn different_songs_split_clusters_and_stay_ordered() {
        let outcome = TrackMatcher::default().merge(vec![
            raw(2, 60.0, "Ceremony", "New Order", 80.0),
            blue_monday(0, 0.0, 80.0),
            blue_monday(1, 30.0, 80.0),
            raw(3, 90.0, "Ceremony", "New Order", 80.0),
        ]);

        let titles: Vec<&str> = outcome.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Blue Monday", "Ceremony"]);
        assert_eq!(outcome.tracks[0].mix_duration_secs, 60.0);
        assert_eq!(outcome.tracks[1].mix_start_secs, 60.0);
    }

    #[test]
    fn interrupted_play_within_threshold_is_not_a_new_occurrence() {
        let matcher = TrackMatcher::new(MatcherOptions {
            max_duplicates: 1,
            ..MatcherOptions::default()
        });
        // A misidentified segment splits one play of Blue Monday in two.
        let outcome = matcher.merge(vec![
            blue_monday(0, 0.0, 90.0),
            blue_monday(1, 30.0, 90.0),
            raw(2, 60.0, "Thieves Like Us", "New Order", 40.0),
            blue_monday(3, 90.0, 90.0),
        ]);

        let titles: Vec<&str> = outcome.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Blue Monday", "Thieves Like Us", "Blue Monday"]);
    }

    #[test]
    fn identity_ignores_case_and_accents() {
        let outcome = TrackMatcher::default().merge(vec![
            raw(0, 0.0, "Café del Mar", "Energy 52", 80.0),
            raw(1, 30.0, "CAFE DEL MAR", "energy 52", 90.0),
        ]);
        assert_eq!(outcome.tracks.len(), 1);
        assert_eq!(outcome.tracks[0].title, "CAFE DEL MAR");
    }

    #[test]
    fn fields_come_from_the_best_match_and_are_unioned() {
        let mut low = blue_monday(0, 0.0, 70.0);
        low.album = Some("Substance".to_string());
        low.artists.push("Arthur Baker".to_string());
        low.external_ids.insert("acrcloud".to_string(), "low".to_string());
        low.external_ids.insert("isrc".to_string(), "GBAAP0000005".to_string());

        let mut high = blue_monday(1, 30.0, 90.0);
        high.title = "BLUE MONDAY".to_string();
        high.artists = vec!["new order".to_string(), "Quincy Jones".to_string()];
        high.external_ids.insert("acrcloud".to_string(), "high".to_string());

        let outcome = TrackMatcher::default().merge(vec![low, high]);
        let track = &outcome.tracks[0];
        assert_eq!(track.title, "BLUE MONDAY");
        assert_eq!(
            track.artists,
            vec![
                "new order".to_string(),
                "Quincy Jones".to_string(),
                "Arthur Baker".to_string()
            ]
        );
        assert_eq!(track.album.as_deref(), Some("Substance"));
        assert_eq!(track.external_links["acrcloud"], "high");
        assert_eq!(track.external_links["isrc"], "GBAAP0000005");
    }

    #[test]
    fn guest_credited_plays_join_the_same_track() {
        let matcher = TrackMatcher::default();
        let merged = matcher
            .merge(vec![
                blue_monday(0, 0.0, 90.0),
                raw(1, 30.0, "Blue Monday", "New Order feat. Arthur Baker", 80.0),
            ])
            .tracks;

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source_matches.len(), 2);
    }

    #[test]
    fn mean_confidence_never_drops_below_the_floor() {
        let matcher = TrackMatcher::new(MatcherOptions {
            min_confidence: 55.55,
            ..MatcherOptions::default()
        });
        let merged = matcher
            .merge(vec![
                blue_monday(0, 0.0, 55.55),
                blue_monday(1, 30.0, 55.55),
                blue_monday(2, 60.0, 55.55),
            ])
            .tracks;

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].confidence, 55.55);
        assert_eq!(matcher.remerge(merged.clone()), merged);
    }

    #[test]
    fn merging_is_idempotent() {
        let matcher = TrackMatcher::default();
        let merged = matcher
            .merge(vec![
                blue_monday(0, 0.0, 80.0),
                blue_monday(1, 30.0, 85.0),
                raw(2, 60.0, "Ceremony", "New Order", 75.0),
                raw(3, 90.0, "Ceremony", "New Order", 65.0),
                blue_monday(10, 300.0, 90.0),
                blue_monday(20, 600.0, 90.0),
            ])
            .tracks;

        // The third play of Blue Monday exceeds the duplicate cap.
        assert_eq!(merged.len(), 3);
        assert_eq!(matcher.remerge(merged.clone()), merged);
    }
}
