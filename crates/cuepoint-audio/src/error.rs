// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Debug, Error)]
pub enum AudioError {
    /// The source cannot be segmented (empty, zero duration, bad segment options).
    #[error("invalid audio source: {0}")]
    InvalidSource(String),

    /// The bytes could not be decoded as audio.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
}
