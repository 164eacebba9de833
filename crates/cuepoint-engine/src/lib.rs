// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cache;
pub mod matcher;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

pub use cache::{fingerprint, CacheEntry, CacheError, ResponseCache};
pub use matcher::{MatcherOptions, MergeOutcome, TrackMatcher};
pub use orchestrator::{
    DispatchOptions, IdentificationError, IdentificationOrchestrator, SegmentResults, Tracklist,
};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryError, RetryEvent, RetryExecutor, RetryHook, RetryPolicy};
