// SPDX-License-Identifier: GPL-3.0-or-later

use std::io::Cursor;

use cuepoint_domain::AudioSegment;
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::Result;

/// Encode a segment as a mono 16-bit RIFF/WAVE file in memory.
pub fn encode_wav(segment: &AudioSegment) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: segment.sample_rate(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + segment.samples().len() * 2));
    let mut writer = WavWriter::new(&mut cursor, spec)?;
    for sample in segment.samples() {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}
