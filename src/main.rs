mod capture;
mod cli;
mod features;
mod ml;
mod processing;
mod protocols;
mod report;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber;

use cli::{Cli, Commands, ModelArgs};
use ml::{Ensemble, EnsembleConfig};
use processing::TrafficAnalyzer;

fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Execute command
    if let Err(e) = run_command(cli.command) {
        error!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Classify(args) => cmd_classify(args),
        Commands::Train(args) => cmd_train(args),
        Commands::Protocols => cmd_protocols(),
    }
}

fn load_config(args: &ModelArgs) -> Result<EnsembleConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading ensemble config from {}", path.display());
            EnsembleConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => EnsembleConfig::default(),
    };

    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(samples) = args.samples {
        config.samples = samples;
    }
    Ok(config)
}

fn cmd_classify(args: cli::ClassifyArgs) -> Result<()> {
    let config = load_config(&args.model)?;
    let analyzer = TrafficAnalyzer::new(Arc::new(Ensemble::new(config)));

    let report = analyzer.analyze_file(&args.file)?;
    debug!("Training passes: {}", analyzer.ensemble().training_runs());

    if args.json {
        println!("{}", report.to_json().context("Failed to serialize report")?);
    } else {
        print!("{}", report.render_text());
    }

    Ok(())
}

fn cmd_train(args: cli::TrainArgs) -> Result<()> {
    let config = load_config(&args.model)?;
    let ensemble = Ensemble::new(config);
    let report = ensemble.train()?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize training report")?
        );
        return Ok(());
    }

    println!("Training Report:");
    println!("  Provider: {}", report.provider);
    println!("  Samples: {}", report.samples);
    match ensemble.config().seed {
        Some(seed) => println!("  Seed: {}", seed),
        None => println!("  Seed: random"),
    }
    println!("  Trained at: {}", report.trained_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Duration: {:.2} seconds", report.duration_secs);
    println!("  CNN final loss: {:.4}", report.cnn_final_loss);
    println!("  CNN accuracy: {:.3}", report.cnn_accuracy);
    println!("  XGBoost accuracy: {:.3}", report.xgboost_accuracy);
    println!(
        "  IsolationForest anomaly rate: {:.3}",
        report.isolation_forest_anomaly_rate
    );

    Ok(())
}

fn cmd_protocols() -> Result<()> {
    println!("Protocol rules (first match wins):\n");
    println!(
        "  {:<10} {:<16} {}",
        protocols::ICMP.name,
        "layer",
        report::category_name(protocols::ICMP.category.id())
    );

    for rule in protocols::APPLICATION_RULES {
        print_rule(rule);
    }
    println!(
        "  {:<10} {:<16} {}",
        protocols::STP.name,
        "layer",
        report::category_name(protocols::STP.category.id())
    );
    for rule in protocols::SYSTEM_RULES {
        print_rule(rule);
    }
    println!(
        "  {:<10} {:<16} {}",
        protocols::OTHER.name,
        "-",
        report::category_name(protocols::OTHER.category.id())
    );

    Ok(())
}

fn print_rule(rule: &protocols::PortRule) {
    let ports = rule
        .ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "  {:<10} {:<16} {}",
        rule.label.name,
        format!("port {}", ports),
        report::category_name(rule.label.category.id())
    );
}
