// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-length, optionally overlapping segmentation of decoded audio.

use std::sync::Arc;

use cuepoint_domain::AudioSegment;
use tracing::{debug, trace};

use crate::{AudioError, DecodedAudio, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentOptions {
    pub length_secs: f64,
    pub overlap_secs: f64,
    /// A trailing segment shorter than this is dropped.
    pub min_segment_secs: f64,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            length_secs: 30.0,
            overlap_secs: 0.0,
            min_segment_secs: 1.0,
        }
    }
}

impl SegmentOptions {
    pub fn stride_secs(&self) -> f64 {
        self.length_secs - self.overlap_secs
    }

    fn validate(&self) -> Result<()> {
        if !self.length_secs.is_finite() || self.length_secs <= 0.0 {
            return Err(AudioError::InvalidSource(format!(
                "segment length must be positive, got {}",
                self.length_secs
            )));
        }
        if !self.overlap_secs.is_finite()
            || self.overlap_secs < 0.0
            || self.overlap_secs >= self.length_secs
        {
            return Err(AudioError::InvalidSource(format!(
                "segment overlap must be in [0, {}), got {}",
                self.length_secs, self.overlap_secs
            )));
        }
        Ok(())
    }
}

/// Splits one decoded source into [`AudioSegment`]s.
///
/// The source buffer is shared, so iterating twice (or cloning the segmenter)
/// does not copy the audio; each emitted segment owns its own slice.
#[derive(Debug, Clone)]
pub struct Segmenter {
    source_id: String,
    audio: Arc<DecodedAudio>,
    options: SegmentOptions,
}

impl Segmenter {
    pub fn new(
        source_id: impl Into<String>,
        audio: DecodedAudio,
        options: SegmentOptions,
    ) -> Result<Self> {
        options.validate()?;
        if audio.sample_rate == 0 {
            return Err(AudioError::InvalidSource(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if audio.duration_secs() <= 0.0 {
            return Err(AudioError::InvalidSource(
                "source has zero duration".to_string(),
            ));
        }

        let segmenter = Self {
            source_id: source_id.into(),
            audio: Arc::new(audio),
            options,
        };
        debug!(
            target: "segmenter",
            source = %segmenter.source_id,
            duration_secs = segmenter.duration_secs(),
            segments = segmenter.len(),
            "segmenter ready"
        );
        Ok(segmenter)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn options(&self) -> &SegmentOptions {
        &self.options
    }

    pub fn duration_secs(&self) -> f64 {
        self.audio.duration_secs()
    }

    /// Number of segments [`Segmenter::segments`] will yield.
    pub fn len(&self) -> usize {
        let mut count = 0;
        while self.segment_bounds(count).is_some() {
            count += 1;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh pass over the source, starting at the first segment.
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            segmenter: self,
            next_index: 0,
        }
    }

    /// Start and duration of segment `index`, or `None` past the end.
    pub fn segment_bounds(&self, index: usize) -> Option<(f64, f64)> {
        let total = self.duration_secs();
        let length = self.options.length_secs;
        let stride = self.options.stride_secs();

        if index > 0 {
            let previous_start = (index - 1) as f64 * stride;
            if previous_start + length >= total {
                return None;
            }
        }

        let start = index as f64 * stride;
        if start >= total {
            return None;
        }
        let duration = length.min(total - start);
        if index > 0 && duration < self.options.min_segment_secs {
            trace!(
                target: "segmenter",
                index,
                duration,
                "dropping short trailing segment"
            );
            return None;
        }
        Some((start, duration))
    }

    fn extract(&self, index: usize, start: f64, duration: f64) -> Result<AudioSegment> {
        let rate = self.audio.sample_rate as f64;
        let total_samples = self.audio.samples.len();
        let first = ((start * rate).round() as usize).min(total_samples);
        let last = (((start + duration) * rate).round() as usize).min(total_samples);

        if first >= last {
            return Err(AudioError::InvalidSource(format!(
                "segment {} at {:.3}s has no samples",
                index, start
            )));
        }

        Ok(AudioSegment::new(
            self.source_id.clone(),
            index,
            start,
            duration,
            self.audio.sample_rate,
            self.audio.samples[first..last].to_vec(),
        ))
    }
}

/// Lazy iterator over the segments of one source.
#[derive(Debug)]
pub struct Segments<'a> {
    segmenter: &'a Segmenter,
    next_index: usize,
}

impl Iterator for Segments<'_> {
    type Item = Result<AudioSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next_index;
        let (start, duration) = self.segmenter.segment_bounds(index)?;
        self.next_index += 1;
        Some(self.segmenter.extract(index, start, duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 100;

    fn audio(duration_secs: f64) -> DecodedAudio {
        let len = (duration_secs * RATE as f64).round() as usize;
        DecodedAudio::new((0..len).map(|i| (i % 1000) as i16).collect(), RATE)
    }

    fn options(length_secs: f64, overlap_secs: f64) -> SegmentOptions {
        SegmentOptions {
            length_secs,
            overlap_secs,
            min_segment_secs: 1.0,
        }
    }

    fn collect(segmenter: &Segmenter) -> Vec<AudioSegment> {
        segmenter
            .segments()
            .collect::<Result<Vec<_>>>()
            .expect("segments")
    }

    #[test]
    fn covers_source_without_gaps() {
        let segmenter = Segmenter::new("mix", audio(95.0), options(30.0, 0.0)).unwrap();
        let segments = collect(&segmenter);

        let starts: Vec<f64> = segments.iter().map(|s| s.start_offset_secs()).collect();
        assert_eq!(starts, vec![0.0, 30.0, 60.0, 90.0]);
        assert_eq!(segments[3].duration_secs(), 5.0);

        for pair in segments.windows(2) {
            assert_eq!(pair[0].end_offset_secs(), pair[1].start_offset_secs());
        }
        let covered: f64 = segments.iter().map(|s| s.duration_secs()).sum();
        assert!((covered - 95.0).abs() < 1e-9);
        assert_eq!(segmenter.len(), 4);
    }

    #[test]
    fn overlapping_segments_share_exactly_the_overlap() {
        let segmenter = Segmenter::new("mix", audio(100.0), options(30.0, 10.0)).unwrap();
        let segments = collect(&segmenter);

        let starts: Vec<f64> = segments.iter().map(|s| s.start_offset_secs()).collect();
        assert_eq!(starts, vec![0.0, 20.0, 40.0, 60.0, 80.0]);
        for pair in segments.windows(2) {
            let shared = pair[0].end_offset_secs() - pair[1].start_offset_secs();
            assert!((shared - 10.0).abs() < 1e-9);
        }
        assert_eq!(segments.last().unwrap().end_offset_secs(), 100.0);

        // Sum of durations minus the overlaps equals the source duration.
        let durations: f64 = segments.iter().map(|s| s.duration_secs()).sum();
        let overlaps = 10.0 * (segments.len() - 1) as f64;
        assert!((durations - overlaps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn short_trailing_segment_is_dropped() {
        let segmenter = Segmenter::new("mix", audio(60.5), options(30.0, 0.0)).unwrap();
        let segments = collect(&segmenter);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].end_offset_secs(), 60.0);
    }

    #[test]
    fn source_shorter_than_one_segment_yields_one_segment() {
        let segmenter = Segmenter::new("mix", audio(12.0), options(30.0, 0.0)).unwrap();
        let segments = collect(&segmenter);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].duration_secs(), 12.0);
        assert_eq!(segments[0].samples().len(), 1200);
    }

    #[test]
    fn segments_carry_their_own_samples() {
        let segmenter = Segmenter::new("mix", audio(4.0), options(2.0, 0.0)).unwrap();
        let segments = collect(&segmenter);
        assert_eq!(segments[1].samples()[0], 200);
        assert_eq!(segments[1].sequence_index(), 1);
        assert_eq!(segments[1].source_id(), "mix");
    }

    #[test]
    fn iteration_is_restartable() {
        let segmenter = Segmenter::new("mix", audio(70.0), options(30.0, 0.0)).unwrap();
        let first: Vec<usize> = segmenter
            .segments()
            .map(|s| s.unwrap().sequence_index())
            .collect();
        let second: Vec<usize> = segmenter
            .segments()
            .map(|s| s.unwrap().sequence_index())
            .collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = Segmenter::new("mix", DecodedAudio::new(Vec::new(), RATE), options(30.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidSource(_)));
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(Segmenter::new("mix", audio(60.0), options(0.0, 0.0)).is_err());
        assert!(Segmenter::new("mix", audio(60.0), options(30.0, 30.0)).is_err());
        assert!(Segmenter::new("mix", audio(60.0), options(30.0, -1.0)).is_err());
    }
}
