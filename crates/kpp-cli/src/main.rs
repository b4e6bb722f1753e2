//! # KPP CLI
//!
//! Command-line driver for the species reordering engine.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use kpp_core::{KineticModel, ModelDescription, OrderingStrategy, ReorderConfig};
use kpp_sparsity::{cheapest, compare_strategies, compile, degree_choice};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kpp")]
#[command(author = "Yatrogenesis")]
#[command(version)]
#[command(about = "Kinetic PreProcessor - Jacobian sparsity and species ordering", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify and reorder a model, report its sparsity structure
    Compile {
        /// Model description (.json)
        model: PathBuf,
        /// Reorder configuration (.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Ordering strategy
        #[arg(short, long, value_enum)]
        strategy: Option<StrategyArg>,
        /// Skip the Jacobian sparsity analysis
        #[arg(long)]
        no_jacobian: bool,
        /// Write the final layout as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Predicted LU nonzeros of every ordering strategy
    Compare {
        /// Model description (.json)
        model: PathBuf,
    },

    /// List ordering strategies
    Strategies,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Unsorted,
    RowDegree,
    ColumnDegree,
    GreedyMinFill,
}

impl From<StrategyArg> for OrderingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Unsorted => Self::Unsorted,
            StrategyArg::RowDegree => Self::RowDegree,
            StrategyArg::ColumnDegree => Self::ColumnDegree,
            StrategyArg::GreedyMinFill => Self::GreedyMinFill,
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ReorderConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ReorderConfig::from_json(&text)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(ReorderConfig::default()),
    }
}

fn load_model(path: &Path, config: &ReorderConfig) -> anyhow::Result<KineticModel> {
    println!("{} '{}'...", "[1/3] Parsing model".green().bold(), path.display());
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading model {}", path.display()))?;
    let model = ModelDescription::from_json(&text)
        .and_then(|description| description.into_model(&config.capacity))
        .with_context(|| format!("loading model {}", path.display()))?;
    println!(
        "      Success: Parsed {} species and {} reactions",
        model.species().len(),
        model.n_reactions()
    );
    Ok(model)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Compile {
            model,
            config,
            strategy,
            no_jacobian,
            output,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(strategy) = strategy {
                config.strategy = strategy.into();
            }
            if no_jacobian {
                config.use_jacobian = false;
            }

            let mut kinetic = load_model(&model, &config)?;

            println!("{}", "[2/3] Computing Jacobian sparsity structure...".green().bold());
            let report = compile(&mut kinetic, &config)?;
            if report.strategy != OrderingStrategy::Unsorted {
                println!("      Optimized variable ordering for sparsity ({})", report.strategy.to_string().cyan());
            }
            println!(
                "      Success: {} variable species, {} fixed species",
                report.counts.variable, report.counts.fixed
            );
            println!(
                "      Jacobian nonzeros: {}, LU nonzeros: {} ({} lower, {} upper)",
                report.jacobian_nonzeros,
                report.lu_nonzeros,
                report.lu_count.lower,
                report.lu_count.upper
            );

            println!("{}", "[3/3] Writing layout...".green().bold());
            match output {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&report)?;
                    fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("      Layout written to {}", path.display());
                }
                None => println!("      {}", "No output file requested".yellow()),
            }
        }

        Commands::Compare { model } => {
            let config = ReorderConfig::default();
            let kinetic = load_model(&model, &config)?;
            let candidates = compare_strategies(&kinetic)?;

            println!("{}", "Predicted LU nonzeros:".green().bold());
            for candidate in &candidates {
                println!("  {:<16} {}", candidate.strategy.to_string().cyan(), candidate.nonzeros);
            }
            let degree = degree_choice(&kinetic)?;
            println!(
                "{} {} ({})",
                "Degree pick:".green().bold(),
                degree.strategy,
                degree.nonzeros
            );
            if let Some(best) = cheapest(&candidates) {
                println!("{} {}", "Cheapest:".green().bold(), best.strategy);
            }
        }

        Commands::Strategies => {
            println!("{}", "Ordering strategies:".green().bold());
            println!();
            println!("  {} - reactive variables first, then by code", "unsorted".cyan());
            println!("  {} - ascending Jacobian row degree", "row-degree".cyan());
            println!("  {} - ascending column degree x row degree", "column-degree".cyan());
            println!("  {} - Markowitz greedy minimum fill (default)", "greedy-min-fill".cyan());
        }
    }

    Ok(())
}
