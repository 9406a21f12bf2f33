use anyhow::{Context, Result};
use bowling_pose::{
    benchmark::{self, BenchmarkStore},
    config::AnalysisConfig,
    error::Error,
    pattern::MotionPattern,
    provider::{PoseProvider, PoseTrack, ProviderChain, TrackPoseProvider, TrackSource},
    sampler::{CancellationToken, VideoSource},
    session::{AnalysisMode, AnalysisResult, AnalysisSession, Progress},
    similarity::SimilarityEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use num_traits::ToPrimitive;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;

#[derive(structopt::StructOpt)]
struct Input {
    /// Pose track recorded for the clip (JSON).
    #[structopt(short, long)]
    poses: PathBuf,

    /// The clip itself. Without it the pose track's timeline is sampled.
    #[cfg(feature = "opencv")]
    #[structopt(short, long)]
    video: Option<PathBuf>,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Score a clip against the benchmark action.
    Analyze {
        #[structopt(flatten)]
        input: Input,

        /// Benchmark document; the bundled benchmark is used when omitted.
        #[structopt(short, long)]
        benchmark: Option<PathBuf>,

        /// benchmark-comparison or pose-similarity.
        #[structopt(short, long, default_value = "benchmark-comparison")]
        mode: AnalysisMode,
    },

    /// Record a clip's motion pattern as a benchmark document.
    Record {
        #[structopt(flatten)]
        input: Input,

        /// Where to write the benchmark document.
        #[structopt(short, long)]
        output: PathBuf,
    },

    /// Compare two saved pattern documents.
    Compare {
        /// Pattern to score.
        input: PathBuf,

        /// Pattern to score against; the bundled benchmark when omitted.
        benchmark: Option<PathBuf>,

        #[structopt(short, long, default_value = "benchmark-comparison")]
        mode: AnalysisMode,
    },
}

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    /// Analysis configuration (JSON). Values it omits keep their defaults.
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// Frame sampling rate.
    #[structopt(long)]
    fps: Option<f64>,

    /// Pose keypoint score threshold.
    #[structopt(short, long)]
    threshold: Option<f32>,

    #[structopt(short, long)]
    show_progress: bool,

    #[structopt(subcommand)]
    command: Command,
}

/// Attach the user-facing explanation to a pipeline error.
fn explain(error: Error) -> anyhow::Error {
    let message = error.user_message();
    if error.is_retryable() {
        warn!(kind = ?error.kind(), "{}; try again", message);
    }
    anyhow::Error::new(error).context(message)
}

fn load_config(opt: &Opt) -> Result<AnalysisConfig> {
    let mut config = match &opt.config {
        Some(path) => AnalysisConfig::from_path(path)
            .with_context(|| format!("failed loading configuration from {:?}", path))?,
        None => AnalysisConfig::default(),
    };
    if let Some(fps) = opt.fps {
        config.sampler.fps = fps;
    }
    if let Some(threshold) = opt.threshold {
        config.features.min_confidence = threshold;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_source(input: &Input, track: &PoseTrack, fps: f64) -> Result<Box<dyn VideoSource>> {
    #[cfg(feature = "opencv")]
    {
        if let Some(video) = &input.video {
            let source = bowling_pose::video::OpenCvSource::open(video)
                .with_context(|| format!("failed opening video {:?}", video))?;
            return Ok(Box::new(source));
        }
    }
    #[cfg(not(feature = "opencv"))]
    let _ = input;
    Ok(Box::new(TrackSource::new(track, fps)))
}

/// The clip's frame source and the pose providers that replay its track.
fn open_input(input: &Input, fps: f64) -> Result<(Box<dyn VideoSource>, ProviderChain)> {
    let track = PoseTrack::from_path(&input.poses)
        .with_context(|| format!("failed loading pose track {:?}", input.poses))?;
    info!(frames = track.frames.len(), "loaded pose track");

    let source = open_source(input, &track, fps)?;
    let providers: Vec<Box<dyn PoseProvider>> = vec![Box::new(TrackPoseProvider::new(track, fps))];
    let provider = ProviderChain::new(providers).context("failed constructing pose providers")?;
    Ok((source, provider))
}

/// Run `analysis` with a progress bar fed from its progress events when
/// `show_progress` is set.
fn with_progress<T>(
    show_progress: bool,
    analysis: impl FnOnce(&mut dyn FnMut(Progress)) -> Result<T, Error>,
) -> Result<T> {
    let progress_bar = if show_progress {
        Some(
            ProgressBar::new(0).with_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold.dim} [{bar:40}] {pos}/{len} frames {wide_msg}"),
            ),
        )
    } else {
        None
    };
    let mut report = |progress: Progress| {
        if let Some(bar) = progress_bar.as_ref() {
            bar.set_length(progress.estimated_total.to_u64().unwrap_or(0));
            bar.set_position(progress.frames_processed.to_u64().unwrap_or(0));
            bar.set_message(format!("{:.0}%", progress.percent));
        }
    };

    let outcome = analysis(&mut report);
    if let Some(bar) = progress_bar {
        bar.finish_and_clear();
    }
    outcome.map_err(explain)
}

fn print_result(result: &AnalysisResult) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(result).context("failed serializing result")?
    );
    Ok(())
}

fn load_pattern(path: Option<&Path>, config: &AnalysisConfig) -> Result<Arc<MotionPattern>> {
    let store = match path {
        Some(path) => BenchmarkStore::from_path(path, config.min_samples),
        None => BenchmarkStore::from_config(config),
    };
    store
        .get()
        .map_err(explain)
        .with_context(|| format!("failed loading pattern {:?}", path))
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let mut config = load_config(&opt)?;

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(opt.log_level),
    )?;

    let cancel = CancellationToken::new();
    let cancel_ctrl_c = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_ctrl_c.cancel();
    })
    .context("failed setting Ctrl-C handler")?;

    match &opt.command {
        Command::Analyze {
            input,
            benchmark,
            mode,
        } => {
            if let Some(path) = benchmark {
                config.benchmark_path = Some(path.clone());
            }
            let store = BenchmarkStore::from_config(&config);
            let (mut source, mut provider) = open_input(input, config.sampler.fps)?;
            let mut session = AnalysisSession::new(config, *mode);
            let result = with_progress(opt.show_progress, |report| {
                session.run(&mut *source, &mut provider, &store, cancel, report)
            })?;
            print_result(&result)?;
        }
        Command::Record { input, output } => {
            let (mut source, mut provider) = open_input(input, config.sampler.fps)?;
            let mut session = AnalysisSession::new(config, AnalysisMode::default());
            let pattern = with_progress(opt.show_progress, |report| {
                session.capture_pattern(&mut *source, &mut provider, cancel, report)
            })?;
            benchmark::save(&pattern, output)
                .map_err(explain)
                .with_context(|| format!("failed writing benchmark {:?}", output))?;
            info!(?output, samples = pattern.len(), "benchmark recorded");
        }
        Command::Compare {
            input,
            benchmark,
            mode,
        } => {
            let input_pattern = load_pattern(Some(input.as_path()), &config)?;
            let benchmark_pattern = load_pattern(benchmark.as_deref(), &config)?;
            let engine = SimilarityEngine::new(config.similarity.clone(), config.min_samples);
            let similarity = match mode {
                AnalysisMode::BenchmarkComparison => {
                    engine.compare(&input_pattern, &benchmark_pattern)
                }
                AnalysisMode::PoseSimilarity => {
                    engine.compare_pose_profiles(&input_pattern, &benchmark_pattern)
                }
            }
            .map_err(explain)?;
            print_result(&AnalysisResult::new(*mode, similarity, &config.speed))?;
        }
    }

    Ok(())
}
