//! echo-wer: word error rate between two transcript files.
//!
//! Both files hold one utterance per line, matched by line number. Prints a
//! one-line JSON summary:
//!
//! ```json
//! {"wer":12.5,"utterances":40,"mean_reward":-0.118}
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use echo_rs::training::{wer_batch, wer_reward};

#[derive(Parser, Debug)]
#[command(name = "echo-wer", about = "Word error rate of hypothesis transcripts")]
struct Args {
    /// Reference transcripts, one per line.
    reference: PathBuf,

    /// Hypothesis transcripts, one per line.
    hypothesis: PathBuf,

    /// Also print each utterance's sentence reward (negative WER).
    #[arg(long)]
    per_line: bool,
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(text.lines().map(str::to_string).collect())
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
    let references = read_lines(&args.reference)?;
    let hypotheses = read_lines(&args.hypothesis)?;
    if references.len() != hypotheses.len() {
        anyhow::bail!(
            "line count mismatch: {} references, {} hypotheses",
            references.len(),
            hypotheses.len()
        );
    }

    let rewards: Vec<f64> = hypotheses
        .iter()
        .zip(&references)
        .map(|(hyp, reference)| wer_reward(hyp, reference))
        .collect();
    if args.per_line {
        for (i, reward) in rewards.iter().enumerate() {
            tracing::info!(line = i + 1, reward, "utterance");
        }
    }

    let mean_reward = if rewards.is_empty() {
        0.0
    } else {
        rewards.iter().sum::<f64>() / rewards.len() as f64
    };
    let summary = serde_json::json!({
        "wer": wer_batch(&references, &hypotheses),
        "utterances": references.len(),
        "mean_reward": mean_reward,
    });
    println!("{summary}");
    Ok(())
}
