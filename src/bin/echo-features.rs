//! echo-features: audio feature extraction CLI.
//!
//! Reads a WAV file, computes the requested features and prints a one-line
//! JSON summary to stdout:
//!
//! ```json
//! {"path":"clip.wav","sample_rate":16000,"duration_s":2.5,"features":{"spectrogram":[128,157]}}
//! ```
//!
//! With `--dump`, the feature tensors are also written to a safetensors file
//! keyed by feature name.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use echo_rs::audio::load_mono;
use echo_rs::features::{FeatureExtractor, FeatureKind, FeatureRequest};
use echo_rs::training::SpeechTokenizer;

#[derive(Parser, Debug)]
#[command(
    name = "echo-features",
    about = "Extract speech features from a WAV file",
    long_about = "Compute spectrogram, pitch, envelope and related features from a WAV file.\n\
                  A JSON summary line is printed to stdout."
)]
struct Args {
    /// Input WAV file (any channel count; downmixed to mono).
    input: PathBuf,

    /// Comma-separated feature names: spectrogram, waveform, pitch, f0, f0t,
    /// harmonics, aperiodics, phase.
    #[arg(long, short = 'f', value_delimiter = ',', default_value = "spectrogram")]
    features: Vec<String>,

    /// JSON feature request file. Replaces --features, --sample-rate and
    /// --hop-length.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Analysis sample rate in Hz.
    #[arg(long, default_value_t = 16000)]
    sample_rate: u32,

    /// Frame step in samples.
    #[arg(long, default_value_t = 256)]
    hop_length: usize,

    /// Comma-separated label ids (used by f0t).
    #[arg(long, value_delimiter = ',')]
    labels: Vec<u32>,

    /// Transcript to tokenize into labels; needs --tokenizer.
    #[arg(long, requires = "tokenizer")]
    transcript: Option<String>,

    /// tokenizer.json used with --transcript.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Write the feature tensors to this safetensors file.
    #[arg(long)]
    dump: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let request = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<FeatureRequest>(&text)
                .with_context(|| format!("invalid feature request {}", path.display()))?
        }
        None => {
            let kinds = args
                .features
                .iter()
                .map(|name| name.trim().parse::<FeatureKind>())
                .collect::<Result<Vec<_>, _>>()?;
            FeatureRequest {
                sample_rate: args.sample_rate,
                hop_length: args.hop_length,
                ..FeatureRequest::only(&kinds)
            }
        }
    };

    let labels = match (&args.transcript, &args.tokenizer) {
        (Some(transcript), Some(path)) => SpeechTokenizer::from_file(path)?.encode(transcript, false)?,
        _ => args.labels.clone(),
    };
    if request.f0t && labels.is_empty() {
        anyhow::bail!("f0t needs label ids: pass --labels or --transcript");
    }

    tracing::info!("Reading {}", args.input.display());
    let sample_rate = request.sample_rate;
    let samples = load_mono(&args.input, sample_rate)?;
    let duration_s = samples.len() as f64 / sample_rate as f64;

    let extractor = FeatureExtractor::new(request)?;
    let features = extractor.extract(&samples, sample_rate, &labels)?;

    let mut shapes = serde_json::Map::new();
    let mut tensors = HashMap::new();
    for (kind, tensor) in features.iter() {
        shapes.insert(kind.name().to_string(), serde_json::json!(tensor.dims()));
        tensors.insert(kind.name().to_string(), tensor.clone());
    }

    if let Some(dump) = &args.dump {
        if let Some(parent) = dump.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(&tensors, dump)?;
        tracing::info!("Wrote {} tensors to {}", tensors.len(), dump.display());
    }

    let summary = serde_json::json!({
        "path": args.input.display().to_string(),
        "sample_rate": sample_rate,
        "duration_s": duration_s,
        "labels": labels.len(),
        "features": shapes,
    });
    println!("{summary}");
    Ok(())
}
