// SPDX-License-Identifier: GPL-3.0-or-later

//! Tracklist exporters.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cuepoint_domain::{RunMetadata, SegmentOutcome, SegmentStatus, Track};
use tracing::info;

pub mod error;
mod json;
mod m3u;
mod markdown;

pub use error::{ExportError, Result};

/// Silence between consecutive tracks shorter than this is not reported.
pub const MIN_GAP_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Json,
    Markdown,
    M3u,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Json, OutputFormat::Markdown, OutputFormat::M3u];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Markdown => "md",
            OutputFormat::M3u => "m3u",
        }
    }

    /// Parse a list of format names. `all` expands to every format; duplicates are dropped.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<OutputFormat>> {
        let mut formats = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.eq_ignore_ascii_case("all") {
                for format in Self::ALL {
                    if !formats.contains(&format) {
                        formats.push(format);
                    }
                }
                continue;
            }
            let format = name.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "m3u" | "m3u8" => Ok(OutputFormat::M3u),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Json => "json",
            OutputFormat::Markdown => "markdown",
            OutputFormat::M3u => "m3u",
        };
        f.write_str(name)
    }
}

/// Everything an exporter needs about one run.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub metadata: &'a RunMetadata,
    pub tracks: &'a [Track],
    pub outcomes: &'a [SegmentOutcome],
}

impl Report<'_> {
    pub fn average_confidence(&self) -> Option<f64> {
        if self.tracks.is_empty() {
            return None;
        }
        Some(self.tracks.iter().map(|t| t.confidence).sum::<f64>() / self.tracks.len() as f64)
    }

    pub fn confidence_range(&self) -> Option<(f64, f64)> {
        let mut confidences = self.tracks.iter().map(|t| t.confidence);
        let first = confidences.next()?;
        Some(confidences.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c))))
    }

    /// Sum of the tracks' durations in the mix.
    pub fn identified_secs(&self) -> f64 {
        self.tracks.iter().map(|t| t.mix_duration_secs).sum()
    }

    pub fn failed_segments(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_gap()).count()
    }

    pub fn skipped_segments(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SegmentStatus::Skipped)
            .count()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        transitions(self.tracks)
    }

    /// Export as `format` into memory.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => json::render(self),
            OutputFormat::Markdown => Ok(markdown::render(self)),
            OutputFormat::M3u => Ok(m3u::render(self)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Gap,
    Overlap,
}

/// A notable boundary between track `index` and the one after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub index: usize,
    pub kind: TransitionKind,
    pub secs: f64,
}

/// Gaps above [`MIN_GAP_SECS`] and overlaps between consecutive tracks.
pub fn transitions(tracks: &[Track]) -> Vec<Transition> {
    tracks
        .windows(2)
        .enumerate()
        .filter_map(|(index, pair)| {
            let (current, next) = (&pair[0], &pair[1]);
            match current.gap_to(next) {
                Some(gap) if gap > MIN_GAP_SECS => Some(Transition {
                    index,
                    kind: TransitionKind::Gap,
                    secs: gap,
                }),
                Some(_) => None,
                None => Some(Transition {
                    index,
                    kind: TransitionKind::Overlap,
                    secs: current.mix_end_secs() - next.mix_start_secs,
                }),
            }
        })
        .collect()
}

/// File name stem safe on common filesystems.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.');
    if trimmed.is_empty() {
        "tracklist".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write `report` in every requested format to `directory`, creating it if needed.
pub fn write_all(
    directory: &Path,
    formats: &[OutputFormat],
    report: &Report<'_>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(directory)?;
    let stem = sanitize_filename(&report.metadata.source_title);

    let mut written = Vec::with_capacity(formats.len());
    for &format in formats {
        let path = directory.join(format!("{}.{}", stem, format.extension()));
        fs::write(&path, report.render(format)?)?;
        info!(
            target: "export",
            format = %format,
            path = %path.display(),
            tracks = report.tracks.len(),
            "tracklist written"
        );
        written.push(path);
    }
    Ok(written)
}
