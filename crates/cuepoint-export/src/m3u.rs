// SPDX-License-Identifier: GPL-3.0-or-later

use crate::Report;

pub(crate) fn render(report: &Report<'_>) -> String {
    let mut out = String::from("#EXTM3U\n");
    out.push_str(&format!("#PLAYLIST:{}\n", report.metadata.source_title));

    if report.tracks.is_empty() {
        out.push_str("#EXTINF:-1,No tracks identified\n");
        return out;
    }

    for track in report.tracks {
        out.push_str(&format!(
            "#EXTINF:{},{} - {}\n",
            track.mix_duration_secs.round() as i64,
            track.artist_credit(),
            track.title
        ));
        out.push_str(&format!("#EXTTIME:{}\n", track.time_in_mix()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn playlist_entries() {
        let metadata = metadata();
        let tracks = tracks();
        let report = Report {
            metadata: &metadata,
            tracks: &tracks,
            outcomes: &[],
        };
        let lines: Vec<String> = render(&report).lines().map(str::to_string).collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#PLAYLIST:Live at the Haçienda: 1983/07");
        assert_eq!(lines[2], "#EXTINF:60,New Order - Blue Monday");
        assert_eq!(lines[3], "#EXTTIME:00:00:00");
        assert_eq!(lines[6], "#EXTINF:30,New Order - Temptation");
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn empty_playlist_has_placeholder() {
        let metadata = metadata();
        let report = Report {
            metadata: &metadata,
            tracks: &[],
            outcomes: &[],
        };
        assert_eq!(
            render(&report),
            "#EXTM3U\n#PLAYLIST:Live at the Haçienda: 1983/07\n#EXTINF:-1,No tracks identified\n"
        );
    }
}
