//! Migration Experiment CLI.
//!
//! Commands:
//! - run: Run the step loop and write results
//! - decompose: Show how generated particles fall into patches

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use migration_experiment::config::ExperimentConfig;
use migration_experiment::decomposition::Decomposition;
use migration_experiment::experiment::ExperimentRunner;
use migration_experiment::generator::{GeneratorConfig, ParticleGenerator};
use migration_experiment::results::format_duration;
use patch_kernel::Precision;

/// Generate a timestamped output path from the given path.
/// e.g., "results.json" -> "results-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

#[derive(Parser)]
#[command(name = "migration-experiment")]
#[command(version)]
#[command(about = "Particle migration and force collection over patch boxes")]
struct Cli {
    /// JSON experiment configuration (flags override its fields)
    #[arg(long, env = "MIGRATION_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment
    Run {
        /// Patches per dimension
        #[arg(long)]
        grid: Option<usize>,

        /// Number of particles
        #[arg(long)]
        particles: Option<usize>,

        /// Steps to run
        #[arg(long)]
        steps: Option<u64>,

        /// Steps between migration phases
        #[arg(long)]
        migration_period: Option<u64>,

        /// Steps between collected frames
        #[arg(long)]
        output_period: Option<u64>,

        /// Position frame precision (low, high, both)
        #[arg(long)]
        precision: Option<String>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Output file for results
        #[arg(long, default_value = "migration.json")]
        output: PathBuf,
    },

    /// Generate particles and show the per-patch distribution
    Decompose {
        /// Patches per dimension
        #[arg(long)]
        grid: Option<usize>,

        /// Number of particles
        #[arg(long)]
        particles: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };

    match cli.command {
        Commands::Run {
            grid,
            particles,
            steps,
            migration_period,
            output_period,
            precision,
            seed,
            output,
        } => {
            if let Some(grid) = grid {
                config.grid = grid;
            }
            if let Some(particles) = particles {
                config.particles = particles;
            }
            if let Some(steps) = steps {
                config.steps = steps;
            }
            if let Some(period) = migration_period {
                config.migration_period = period;
            }
            if let Some(period) = output_period {
                config.output_period = period;
            }
            if let Some(precision) = precision {
                config.precision = parse_precision(&precision)?;
            }
            if seed.is_some() {
                config.seed = seed;
            }

            info!(
                grid = config.grid,
                particles = config.particles,
                steps = config.steps,
                "Starting migration experiment"
            );

            let runner = ExperimentRunner::new(config);
            let result = runner.run().await?;

            let output_path = timestamped_path(&output);
            result.save(&output_path)?;

            let elapsed = (result.ended_at - result.started_at).num_milliseconds().max(0) as u64;
            println!("\n=== Experiment Result ===");
            println!("Run: {}", result.run_id);
            println!("Steps: {}", result.steps.len());
            println!("Duration: {}", format_duration(elapsed));
            println!("Migrations: {}", result.total_migrations());
            println!("Final kinetic energy: {:.4}", result.final_kinetic_energy());
            println!("Momentum drift: {:.3e}", result.momentum_drift());
            println!(
                "Frames: {} positions, {} velocities",
                result.frames_of("positions"),
                result.frames_of("velocities")
            );
            if !result.rejected_contributions.is_empty() {
                println!("Rejected contributions:");
                for rejected in &result.rejected_contributions {
                    println!("  {}", rejected);
                }
            }
            println!(
                "Atom map: {} assigned, {} unassigned",
                result.map_check.assigned, result.map_check.unassigned
            );
            println!("Results saved to: {}", output_path.display());
        }

        Commands::Decompose {
            grid,
            particles,
            seed,
        } => {
            let decomposition =
                Decomposition::new(grid.unwrap_or(config.grid), config.half_width);
            let generated = ParticleGenerator::new(GeneratorConfig {
                particles: particles.unwrap_or(config.particles),
                half_width: config.half_width,
                max_velocity: config.max_velocity,
                seed: seed.or(config.seed),
            })
            .generate();

            let mut counts = vec![0usize; decomposition.num_patches()];
            for particle in &generated {
                counts[decomposition.patch_of(particle.position).0 as usize] += 1;
            }

            println!(
                "{} patches, {} tasks",
                decomposition.num_patches(),
                decomposition.tasks().len()
            );
            for (patch, count) in counts.iter().enumerate() {
                println!("  patch {:>4}: {:>6} particles", patch, count);
            }
        }
    }

    Ok(())
}

fn parse_precision(s: &str) -> Result<Precision> {
    match s.to_lowercase().as_str() {
        "low" | "single" | "f32" => Ok(Precision::Low),
        "high" | "double" | "f64" => Ok(Precision::High),
        "both" => Ok(Precision::Both),
        _ => anyhow::bail!("Unknown precision: {}. Valid: low, high, both", s),
    }
}
