// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Write;

use cuepoint_domain::{format_timestamp, Track};

use crate::{Report, TransitionKind};

fn track_line(track: &Track) -> String {
    format!(
        "- [{}] **{}** - {} ({:.0}%)",
        track.time_in_mix(),
        track.artist_credit(),
        track.title,
        track.confidence
    )
}

pub(crate) fn render(report: &Report<'_>) -> String {
    let tracks = report.tracks;
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "# {}\n", report.metadata.source_title);
    let _ = writeln!(
        out,
        "**Analyzed:** {}  ",
        report.metadata.analyzed_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(
        out,
        "**Duration:** {}\n",
        format_timestamp(report.metadata.source_duration_secs)
    );

    out.push_str("## Tracklist\n\n");
    if tracks.is_empty() {
        out.push_str("*No tracks identified*\n");
    }
    for track in tracks {
        out.push_str(&track_line(track));
        out.push('\n');
    }

    out.push_str("\n## Analysis Summary\n\n");
    let _ = writeln!(out, "- **Track Count:** {}", tracks.len());
    match report.average_confidence() {
        Some(average) => {
            let _ = writeln!(out, "- **Average Confidence:** {:.1}%", average);
        }
        None => out.push_str("- **Average Confidence:** N/A\n"),
    }
    if report.failed_segments() > 0 {
        let _ = writeln!(
            out,
            "- **Unidentified Segments:** {} of {}",
            report.failed_segments(),
            report.outcomes.len()
        );
    }

    let transitions = report.transitions();
    if !transitions.is_empty() {
        out.push_str("\n### Timing Analysis\n\n");
    }
    for transition in transitions {
        let current = &tracks[transition.index];
        let next = &tracks[transition.index + 1];
        let _ = match transition.kind {
            TransitionKind::Gap => writeln!(
                out,
                "- **{}** - Gap of {:.1}s after \"{}\"",
                current.time_in_mix(),
                transition.secs,
                current.title
            ),
            TransitionKind::Overlap => writeln!(
                out,
                "- **{}** - Overlap of {:.1}s between \"{}\" and \"{}\"",
                current.time_in_mix(),
                transition.secs,
                current.title,
                next.title
            ),
        };
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn lists_tracks_with_timestamp_and_confidence() {
        let metadata = metadata();
        let tracks = tracks();
        let outcomes = outcomes();
        let report = Report {
            metadata: &metadata,
            tracks: &tracks,
            outcomes: &outcomes,
        };
        let text = render(&report);

        assert!(text.starts_with("# Live at the Haçienda: 1983/07\n"));
        assert!(text.contains("- [00:00:00] **New Order** - Blue Monday (85%)\n"));
        assert!(text.contains("- [00:01:30] **New Order** - Ceremony (70%)\n"));
        assert!(text.contains("- **Average Confidence:** 83.3%"));
        assert!(text.contains("- **Unidentified Segments:** 1 of 6"));
        assert!(text.contains("Gap of 30.0s after \"Blue Monday\""));
        assert!(text.contains("Overlap of 10.0s between \"Ceremony\" and \"Temptation\""));
    }

    #[test]
    fn empty_tracklist() {
        let metadata = metadata();
        let report = Report {
            metadata: &metadata,
            tracks: &[],
            outcomes: &[],
        };
        let text = render(&report);
        assert!(text.contains("*No tracks identified*"));
        assert!(text.contains("- **Average Confidence:** N/A"));
        assert!(!text.contains("Timing Analysis"));
    }
}
