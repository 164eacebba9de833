// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use chrono::{DateTime, Utc};
use cuepoint_domain::{format_timestamp, ExternalIds, MatchRef, Track};
use serde::Serialize;
use uuid::Uuid;

use crate::{Report, Result, TransitionKind};

#[derive(Serialize)]
struct Document<'a> {
    mix_info: MixInfo<'a>,
    analysis_info: AnalysisInfo,
    tracks: Vec<TrackEntry<'a>>,
}

#[derive(Serialize)]
struct MixInfo<'a> {
    run_id: Uuid,
    title: &'a str,
    source_path: Option<&'a Path>,
    duration_secs: f64,
    duration_formatted: String,
    track_count: usize,
}

#[derive(Serialize)]
struct AnalysisInfo {
    timestamp: DateTime<Utc>,
    track_count: usize,
    average_confidence: f64,
    min_confidence: f64,
    max_confidence: f64,
    identified_secs: f64,
    segments: SegmentSummary,
    gaps_detected: usize,
    overlaps_detected: usize,
    timing_quality: TimingQuality,
}

#[derive(Serialize)]
struct SegmentSummary {
    total: usize,
    failed: usize,
    skipped: usize,
}

#[derive(Serialize)]
struct TimingQuality {
    gaps: Vec<TimingNote>,
    overlaps: Vec<TimingNote>,
}

#[derive(Serialize)]
struct TimingNote {
    position: String,
    duration: f64,
    first_track: String,
    second_track: String,
}

#[derive(Serialize)]
struct TrackEntry<'a> {
    title: &'a str,
    artists: &'a [String],
    album: Option<&'a str>,
    time_in_mix: String,
    confidence: f64,
    timing: Timing,
    gap_to_next: Option<f64>,
    overlaps_next: Option<bool>,
    external_links: &'a ExternalIds,
    source_matches: &'a [MatchRef],
}

#[derive(Serialize)]
struct Timing {
    start_time: f64,
    end_time: f64,
    duration: f64,
    duration_formatted: String,
}

fn track_entry<'a>(track: &'a Track, next: Option<&Track>) -> TrackEntry<'a> {
    TrackEntry {
        title: &track.title,
        artists: &track.artists,
        album: track.album.as_deref(),
        time_in_mix: track.time_in_mix(),
        confidence: track.confidence,
        timing: Timing {
            start_time: track.mix_start_secs,
            end_time: track.mix_end_secs(),
            duration: track.mix_duration_secs,
            duration_formatted: format_timestamp(track.mix_duration_secs),
        },
        gap_to_next: next.and_then(|next| track.gap_to(next)),
        overlaps_next: next.map(|next| track.overlaps_with(next)),
        external_links: &track.external_links,
        source_matches: &track.source_matches,
    }
}

pub(crate) fn render(report: &Report<'_>) -> Result<String> {
    let tracks = report.tracks;
    let transitions = report.transitions();
    let note = |index: usize, duration: f64| TimingNote {
        position: format!("Between track {} and {}", index + 1, index + 2),
        duration,
        first_track: tracks[index].title.clone(),
        second_track: tracks[index + 1].title.clone(),
    };
    let gaps: Vec<TimingNote> = transitions
        .iter()
        .filter(|t| t.kind == TransitionKind::Gap)
        .map(|t| note(t.index, t.secs))
        .collect();
    let overlaps: Vec<TimingNote> = transitions
        .iter()
        .filter(|t| t.kind == TransitionKind::Overlap)
        .map(|t| note(t.index, t.secs))
        .collect();
    let (min_confidence, max_confidence) = report.confidence_range().unwrap_or((0.0, 0.0));

    let document = Document {
        mix_info: MixInfo {
            run_id: report.metadata.run_id,
            title: &report.metadata.source_title,
            source_path: report.metadata.source_path.as_deref(),
            duration_secs: report.metadata.source_duration_secs,
            duration_formatted: format_timestamp(report.metadata.source_duration_secs),
            track_count: tracks.len(),
        },
        analysis_info: AnalysisInfo {
            timestamp: report.metadata.analyzed_at,
            track_count: tracks.len(),
            average_confidence: report.average_confidence().unwrap_or(0.0),
            min_confidence,
            max_confidence,
            identified_secs: report.identified_secs(),
            segments: SegmentSummary {
                total: report.outcomes.len(),
                failed: report.failed_segments(),
                skipped: report.skipped_segments(),
            },
            gaps_detected: gaps.len(),
            overlaps_detected: overlaps.len(),
            timing_quality: TimingQuality { gaps, overlaps },
        },
        tracks: tracks
            .iter()
            .enumerate()
            .map(|(i, track)| track_entry(track, tracks.get(i + 1)))
            .collect(),
    };

    Ok(serde_json::to_string_pretty(&document)?)
}
