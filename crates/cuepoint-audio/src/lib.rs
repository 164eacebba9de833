// SPDX-License-Identifier: GPL-3.0-or-later

//! Audio input for the identification pipeline.
//!
//! - [`decoder`]: turns audio files into mono 16-bit PCM
//! - [`segmenter`]: slices decoded audio into timestamped segments
//! - [`wav`]: re-encodes a segment for providers that want an audio file upload

pub mod decoder;
pub mod error;
pub mod segmenter;
pub mod wav;

pub use decoder::{DecodedAudio, Decoder, SymphoniaDecoder};
pub use error::{AudioError, Result};
pub use segmenter::{SegmentOptions, Segmenter, Segments};
pub use wav::encode_wav;
