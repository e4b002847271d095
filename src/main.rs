//! detectgpt CLI: zero-shot machine-generated text detection

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use detectgpt::{
    Corpus, DetectConfig, DetectionMetrics, Experiment, Gpt2Scorer, HfTokenizer, LogProbScorer,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "detectgpt")]
#[command(about = "Zero-shot detection of machine-generated text via probability curvature")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full experiment over a JSON-lines dataset
    Run {
        /// Path to JSON-lines dataset (`{"text": ..., "model": "human" | <name>}`)
        #[arg(short, long)]
        data: PathBuf,

        /// Output directory for results
        #[arg(short, long, default_value = "outputs")]
        output: PathBuf,

        /// Texts taken from each class
        #[arg(long)]
        n_samples: Option<usize>,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Score a single text
    Score {
        /// Text to score
        #[arg(short, long)]
        text: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Causal scoring model ID from `HuggingFace` (e.g., "openai-community/gpt2-xl")
    #[arg(long)]
    scoring_model: Option<String>,

    /// Span-infill model ID from `HuggingFace` (e.g., "google-t5/t5-3b")
    #[arg(long)]
    infill_model: Option<String>,

    /// Perturbations per text
    #[arg(short = 'p', long)]
    n_perturbations: Option<usize>,

    /// Fraction of words that start a masked span
    #[arg(long)]
    mask_ratio: Option<f64>,

    /// Sub-batch size for both models
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

impl CommonArgs {
    fn resolve(&self) -> Result<DetectConfig> {
        let mut config = match &self.config {
            Some(path) => DetectConfig::load(path)?,
            None => DetectConfig::default(),
        };
        if let Some(model) = &self.scoring_model {
            config.scoring_model.clone_from(model);
        }
        if let Some(model) = &self.infill_model {
            config.infill_model.clone_from(model);
        }
        if let Some(p) = self.n_perturbations {
            config.n_perturbations = p;
        }
        if let Some(r) = self.mask_ratio {
            config.masking.mask_ratio = r;
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.force_cpu |= self.cpu;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Run {
            data,
            output,
            n_samples,
            common,
        } => {
            let mut config = common.resolve()?;
            if let Some(n) = n_samples {
                config.n_samples = n;
            }
            run(config, &data, &output)
        }
        Command::Score { text, common } => {
            let config = common.resolve()?;
            score(config, &text, common.n_perturbations.is_some())
        }
    }
}

fn run(config: DetectConfig, data: &Path, output: &Path) -> Result<()> {
    println!("=== DetectGPT ===");
    println!("Scoring model: {}", config.scoring_model);
    println!("Infill model:  {}", config.infill_model);
    println!("Data:          {}", data.display());
    println!("Output:        {}", output.display());
    println!(
        "Perturbations: {} (mask ratio {})",
        config.n_perturbations, config.masking.mask_ratio
    );
    if config.force_cpu {
        println!("Mode:          CPU (forced)");
    }

    let corpus = Corpus::load_jsonl(data)?;
    info!(
        "Corpus: {} human, {} machine texts",
        corpus.human_count(),
        corpus.machine_count()
    );

    info!("Loading models...");
    let mut experiment = Experiment::from_pretrained(config)?;
    let results = experiment.run(&corpus)?;

    println!("\n=== Results ===");
    print_metrics("DetectGPT (d)", &results.detectgpt);
    print_metrics("DetectGPT (z)", &results.detectgpt_normalized);
    print_metrics("Likelihood", &results.likelihood_baseline);

    // Save results
    std::fs::create_dir_all(output)?;
    let results_path = output.join("detectgpt_results.json");
    std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    info!("Results saved to {}", results_path.display());

    Ok(())
}

fn score(config: DetectConfig, text: &str, with_perturbations: bool) -> Result<()> {
    let texts = vec![text.to_string()];

    if with_perturbations {
        let mut experiment = Experiment::from_pretrained(config)?;
        let record = experiment.score_texts(&texts)?;
        println!("Log-probability:         {:.4}", record.base_log_probs[0]);
        println!("Discrepancy:             {:.4}", record.discrepancies[0]);
        println!("Normalized discrepancy:  {:.4}", record.normalized_discrepancies[0]);
    } else {
        let tokenizer = Arc::new(HfTokenizer::from_hub(&config.scoring_model, true)?);
        let model = Arc::new(Gpt2Scorer::from_hub(&config.scoring_model, config.force_cpu)?);
        let scorer = LogProbScorer::new(model, tokenizer, config.batch_size);
        let scores = scorer.score(&texts)?;
        println!("Log-probability: {:.4}", scores[0]);
    }

    Ok(())
}

fn print_metrics(name: &str, metrics: &DetectionMetrics) {
    let threshold = metrics
        .threshold
        .as_ref()
        .map_or_else(|| "-".to_string(), |fit| format!("{:.1}%", fit.accuracy * 100.0));
    println!(
        "{:<14} ROC AUC {:.4}  accuracy {}  ({} human, {} machine)",
        name, metrics.roc_auc, threshold, metrics.n_human, metrics.n_machine
    );
}
