// SPDX-License-Identifier: GPL-3.0-or-later

//! External recognition and metadata services.
//!
//! Every service implements [`Provider`] and exposes the capabilities it has:
//! [`Recognizer`] for identifying a segment of audio, [`Enricher`] for filling
//! in metadata on an existing match. The pipeline only ever asks a provider for
//! a capability; it never matches on concrete types.

pub mod acrcloud;
pub mod error;
pub mod provider;
pub mod registry;
pub mod spotify;

pub use acrcloud::{AcrCloudClient, AcrCloudClientBuilder};
pub use error::{ProviderError, ProviderErrorKind, Result};
pub use provider::{Enricher, Provider, Recognizer};
pub use registry::ProviderRegistry;
pub use spotify::{SpotifyClient, SpotifyClientBuilder};

/// User agent sent with every outgoing request.
pub(crate) const USER_AGENT: &str = concat!("cuepoint/", env!("CARGO_PKG_VERSION"));
