// SPDX-License-Identifier: GPL-3.0-or-later

//! Decoding audio files into mono PCM with symphonia.
//!
//! Supported containers and codecs: MP3, FLAC, WAV/PCM, OGG Vorbis, AAC in MP4.
//! Multi-channel audio is mixed down to a single channel.

use std::fs::File;
use std::io::{Cursor, ErrorKind};
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, instrument, warn};

use crate::{AudioError, Result};

/// Fully decoded audio: mono, 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Source of decoded audio for the segmenter.
pub trait Decoder: Send + Sync {
    fn decode_file(&self, path: &Path) -> Result<DecodedAudio>;

    /// Decode an in-memory buffer. `extension` is a format hint such as `"mp3"`.
    fn decode_bytes(&self, bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_stream(
        &self,
        source: Box<dyn MediaSource>,
        extension: Option<&str>,
    ) -> Result<DecodedAudio> {
        let mss = MediaSourceStream::new(source, Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::InvalidAudio(format!("unrecognized format: {}", e)))?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| AudioError::InvalidAudio("no audio track found".to_string()))?;
        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::InvalidAudio(format!("unsupported codec: {}", e)))?;

        let mut samples: Vec<i16> = Vec::new();
        let mut buffer: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    break
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(AudioError::InvalidAudio(format!(
                        "error reading packet: {}",
                        e
                    )))
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(target: "decoder", error = %e, "skipping corrupt frame");
                    continue;
                }
                Err(e) => {
                    return Err(AudioError::InvalidAudio(format!(
                        "failed to decode frame: {}",
                        e
                    )))
                }
            };

            let spec = *decoded.spec();
            if spec.rate > 0 {
                sample_rate = spec.rate;
            }
            let channels = spec.channels.count().max(1);

            let needed = decoded.capacity() as u64;
            let mut buf = match buffer.take() {
                Some(buf) if buf.capacity() as u64 >= needed * channels as u64 => buf,
                _ => SampleBuffer::<f32>::new(needed, spec),
            };
            buf.copy_interleaved_ref(decoded);

            for frame in buf.samples().chunks(channels) {
                let mixed = frame.iter().sum::<f32>() / channels as f32;
                samples.push((mixed.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
            }
            buffer = Some(buf);
        }

        if samples.is_empty() || sample_rate == 0 {
            return Err(AudioError::InvalidAudio(
                "stream contained no audio samples".to_string(),
            ));
        }

        debug!(
            target: "decoder",
            sample_count = samples.len(),
            sample_rate,
            "decoded audio"
        );
        Ok(DecodedAudio::new(samples, sample_rate))
    }
}

impl Decoder for SymphoniaDecoder {
    #[instrument(skip(self), fields(file = ?path))]
    fn decode_file(&self, path: &Path) -> Result<DecodedAudio> {
        let file = File::open(path).map_err(|e| {
            AudioError::InvalidSource(format!("cannot open {}: {}", path.display(), e))
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        self.decode_stream(Box::new(file), extension.as_deref())
    }

    fn decode_bytes(&self, bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio> {
        if bytes.is_empty() {
            return Err(AudioError::InvalidSource("empty audio buffer".to_string()));
        }
        self.decode_stream(Box::new(Cursor::new(bytes)), extension)
    }
}
