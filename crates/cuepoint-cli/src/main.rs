// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use cuepoint_audio::{Decoder, SegmentOptions, SymphoniaDecoder};
use cuepoint_config::{load as load_config, AppConfig};
use cuepoint_domain::RunMetadata;
use cuepoint_engine::{
    DispatchOptions, IdentificationOrchestrator, MatcherOptions, RateLimiter, ResponseCache,
    RetryExecutor, RetryPolicy, TrackMatcher,
};
use cuepoint_export::{write_all, OutputFormat, Report, TransitionKind};
use cuepoint_providers::ProviderRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cuepoint", version, about = "Identify the tracks played in a DJ mix")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Segment length in seconds
    #[arg(long)]
    segment_length: Option<f64>,

    /// Output formats: json, markdown, m3u or all (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    formats: Vec<String>,

    /// Directory the tracklists are written to
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Audio file of the mix
    audio_file: PathBuf,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(length) = self.segment_length {
            config.segment.length_secs = length;
        }
        if !self.formats.is_empty() {
            config.output.formats = self.formats.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output.directory = dir.clone();
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    cli.apply_overrides(&mut config)?;
    init_tracing(&config.telemetry.log_level, cli.verbose);

    let formats = OutputFormat::parse_list(config.output.formats.as_slice())?;
    if !cli.audio_file.is_file() {
        bail!("audio file not found: {}", cli.audio_file.display());
    }

    let path = cli.audio_file.clone();
    let audio = tokio::task::spawn_blocking(move || SymphoniaDecoder::new().decode_file(&path))
        .await
        .context("decoder task failed")?
        .with_context(|| format!("cannot decode {}", cli.audio_file.display()))?;
    let metadata = RunMetadata::new(source_title(&cli.audio_file), audio.duration_secs())
        .with_source_path(&cli.audio_file);
    info!(
        target: "cli",
        file = %cli.audio_file.display(),
        duration_secs = audio.duration_secs(),
        sample_rate = audio.sample_rate,
        "audio decoded"
    );

    let orchestrator = build_orchestrator(&config)?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let tracklist = orchestrator
        .run(
            &metadata.source_title,
            audio,
            segment_options(&config),
            &cancel,
        )
        .await?;

    let report = Report {
        metadata: &metadata,
        tracks: &tracklist.tracks,
        outcomes: &tracklist.outcomes,
    };
    let transitions = report.transitions();
    info!(
        target: "cli",
        tracks = tracklist.tracks.len(),
        gaps = tracklist.gap_count(),
        segments = tracklist.segments_total(),
        silent_gaps = transitions.iter().filter(|t| t.kind == TransitionKind::Gap).count(),
        overlaps = transitions.iter().filter(|t| t.kind == TransitionKind::Overlap).count(),
        rejected = tracklist.rejected,
        "analysis complete"
    );
    if tracklist.interrupted {
        warn!(target: "cli", "run was interrupted, tracklist is partial");
    }

    for path in write_all(&config.output.directory, &formats, &report)? {
        println!("{}", path.display());
    }
    Ok(())
}

fn init_tracing(log_level: &str, verbose: bool) {
    let fmt_layer = fmt::layer().with_target(true).with_thread_names(true).with_level(true);
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn build_orchestrator(config: &AppConfig) -> Result<IdentificationOrchestrator> {
    let registry = ProviderRegistry::from_config(&config.providers)
        .context("no usable recognition provider")?;
    let matcher = TrackMatcher::new(MatcherOptions::from_config(
        &config.matching,
        config.segment.length_secs,
    ));
    let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));

    Ok(IdentificationOrchestrator::new(registry, matcher)
        .with_rate_limiter(RateLimiter::from_config(&config.rate_limit))
        .with_cache(ResponseCache::from_config(&config.cache))
        .with_retry(retry)
        .with_options(DispatchOptions::from_config(config)))
}

fn segment_options(config: &AppConfig) -> SegmentOptions {
    SegmentOptions {
        length_secs: config.segment.length_secs,
        overlap_secs: config.segment.overlap_secs,
        min_segment_secs: config.segment.min_segment_secs,
    }
}

/// Title used for run metadata and output file names.
fn source_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mix".to_string())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(target: "cli", error = %e, "cannot listen for ctrl-c");
                return;
            }
            warn!(target: "cli", "interrupt received, finishing in-flight segments");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}
