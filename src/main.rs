use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use cellprog::core::graph::knn::get_knn_method;
use cellprog::pipeline::config::PipelineConfig;
use cellprog::pipeline::input::{read_labels_file, read_long_counts_file};
use cellprog::pipeline::output::write_outputs;
use cellprog::pipeline::runner::run_pipeline;
use cellprog::single_cell::batch_corrections::parse_harmony_convergence;
use cellprog::single_cell::processing::parse_covariate;
use cellprog::single_cell::sc_knn_snn::get_snn_similiarity_method;

/// Single-cell clustering and cross-sample NMF meta-programs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run QC, clustering, markers and meta-programs on a count table
    Run(RunArgs),
    /// Print the default configuration as JSON
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Long-format count table (`cell,sample,gene,count`)
    #[arg(long)]
    counts: PathBuf,

    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// JSON configuration (defaults are used for missing fields)
    #[arg(long)]
    config: Option<PathBuf>,

    /// One label per cluster of the main clustering, one per line
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the main cluster resolution
    #[arg(long)]
    resolution: Option<f64>,

    /// Override the kNN search (exact or hnsw)
    #[arg(long)]
    knn_method: Option<String>,

    /// Override the SNN weighting (jaccard or rank)
    #[arg(long)]
    snn_similarity: Option<String>,

    /// Override the batch correction convergence criterion
    /// (assignment_change or objective_change)
    #[arg(long)]
    convergence: Option<String>,

    /// Override the covariates regressed out before scaling
    /// (n_features, mito_fraction, total_count)
    #[arg(long, value_delimiter = ',')]
    regress_out: Option<Vec<String>>,

    /// Skip batch correction
    #[arg(long, default_value_t = false)]
    no_batch_correction: bool,
}

fn load_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(res) = args.resolution {
        config.cluster.cluster_resolution = res;
    }
    if let Some(s) = &args.knn_method {
        config.graph.knn_method =
            get_knn_method(s).ok_or_else(|| anyhow!("unknown kNN method '{}'", s))?;
    }
    if let Some(s) = &args.snn_similarity {
        config.graph.snn_similarity = get_snn_similiarity_method(s)
            .ok_or_else(|| anyhow!("unknown SNN similarity '{}'", s))?;
    }
    if let Some(s) = &args.convergence {
        config.batch.convergence = parse_harmony_convergence(s)
            .ok_or_else(|| anyhow!("unknown convergence criterion '{}'", s))?;
    }
    if let Some(covariates) = &args.regress_out {
        config.scale.regress_out = covariates
            .iter()
            .map(|s| parse_covariate(s).ok_or_else(|| anyhow!("unknown covariate '{}'", s)))
            .collect::<anyhow::Result<Vec<_>>>()?;
    }
    if args.no_batch_correction {
        config.batch.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn run(args: &RunArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = load_config(args)?;

    let store = read_long_counts_file(&args.counts, &config.qc.mito_prefix)
        .with_context(|| format!("reading counts {}", args.counts.display()))?;
    let labels = match &args.labels {
        Some(path) => Some(
            read_labels_file(path)
                .with_context(|| format!("reading labels {}", path.display()))?,
        ),
        None => None,
    };

    let (artifacts, outputs) = run_pipeline(&store, &config)?;
    write_outputs(&args.out, &artifacts, &outputs, labels.as_deref())?;

    let config_path = args.out.join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    let n_warnings = artifacts.all_warnings().len();
    if n_warnings > 0 {
        log::warn!("Finished with {} warnings (see warnings.json)", n_warnings);
    }
    log::info!("Total run time: {:.2?}", start.elapsed());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Run(args) => run(args)?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::default())?);
        }
    }

    Ok(())
}
