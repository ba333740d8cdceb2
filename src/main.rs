//! rune-compose - run multi-container projects described by a compose file
//!
//! This is the main CLI entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rune_compose::compose::{
    ComposeOrchestrator, ComposeParser, DependencyResolver, Project, ProjectOptions,
    SuperviseOutcome, UpOptions,
};
use rune_compose::engine::DockerCli;
use rune_compose::settings::{Settings, DEFAULT_ENGINE};
use rune_compose::storage::VolumeManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// rune-compose - Compose-compatible service orchestrator
#[derive(Parser)]
#[command(name = "rune-compose")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Run multi-container projects described by a compose file", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file; repeat to merge several files in order
    #[arg(short = 'f', long = "file", global = true, env = "RUNE_COMPOSE_FILE", value_delimiter = ':')]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long, global = true, env = "RUNE_PROJECT_NAME")]
    project_name: Option<String>,

    /// Project directory (defaults to the directory of the first compose file)
    #[arg(long, global = true)]
    project_directory: Option<PathBuf>,

    /// Directory for volumes and other state
    #[arg(long, global = true, env = "RUNE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Container engine binary
    #[arg(long, global = true, env = "RUNE_ENGINE", default_value = DEFAULT_ENGINE)]
    engine: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start services
    Up {
        /// Build images before starting
        #[arg(long)]
        build: bool,
        /// Stop everything as soon as a service fails
        #[arg(long)]
        abort_on_failure: bool,
        /// Services to start (default: all)
        services: Vec<String>,
    },

    /// Stop and remove services
    Down {
        /// Also remove named volumes declared by the project
        #[arg(short, long)]
        volumes: bool,
    },

    /// Build service images
    Build {
        /// Services to build (default: all with a build section)
        services: Vec<String>,
    },

    /// Validate and print the project
    Config {
        /// Print the resolved start order instead
        #[arg(long)]
        order: bool,
    },

    /// List project volumes
    Volumes,
}

impl Cli {
    fn project_options(&self) -> anyhow::Result<ProjectOptions> {
        let dir = match (&self.project_directory, self.files.first()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(file)) => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            (None, None) => PathBuf::from("."),
        };
        let working_dir = dir
            .canonicalize()
            .with_context(|| format!("Project directory {} not found", dir.display()))?;

        Ok(ProjectOptions {
            files: self.files.clone(),
            project_name: self.project_name.clone(),
            working_dir,
        })
    }

    fn settings(&self) -> Settings {
        let settings = Settings::default().engine(&self.engine);
        match &self.state_dir {
            Some(dir) => settings.state_dir(dir.clone()),
            None => settings,
        }
    }
}

fn orchestrator(project: Project, settings: Settings) -> anyhow::Result<ComposeOrchestrator> {
    let engine = Arc::new(DockerCli::new(&settings.engine));
    let volumes = Arc::new(
        VolumeManager::new(settings.volumes_dir())
            .with_context(|| format!("Cannot open state directory {}", settings.state_dir.display()))?,
    );
    Ok(ComposeOrchestrator::new(
        project,
        engine.clone(),
        engine,
        volumes,
        settings,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = cli.project_options()?;
    let project = ComposeParser::load(&options).context("Failed to load compose project")?;
    let settings = cli.settings();

    match cli.command {
        Commands::Up {
            build,
            abort_on_failure,
            services,
        } => {
            let mut orchestrator = orchestrator(project, settings)?;
            let report = orchestrator
                .up(UpOptions { services, build })
                .await
                .context("Failed to start project")?;

            for (service, error) in &report.failed {
                eprintln!("{}: {}", service, error);
            }

            let outcome = if abort_on_failure && !report.is_complete() {
                SuperviseOutcome::Aborted(report.failed[0].0.clone())
            } else {
                println!("Started {} service(s), press Ctrl-C to stop", report.started.len());
                orchestrator
                    .supervise(shutdown_signal(), abort_on_failure)
                    .await?
            };

            orchestrator.down(false).await.context("Failed to stop project")?;

            if let SuperviseOutcome::Aborted(service) = outcome {
                anyhow::bail!("Service {} failed", service);
            }
        }

        Commands::Down { volumes } => {
            let mut orchestrator = orchestrator(project, settings)?;
            orchestrator
                .down(volumes)
                .await
                .context("Failed to stop project")?;
        }

        Commands::Build { services } => {
            let orchestrator = orchestrator(project, settings)?;
            let built = orchestrator
                .build_services(&services)
                .await
                .context("Build failed")?;
            for tag in built {
                println!("Built {}", tag);
            }
        }

        Commands::Config { order } => {
            let resolver = DependencyResolver::new(&project);
            if order {
                for (i, level) in resolver.levels()?.iter().enumerate() {
                    println!("{}: {}", i + 1, level.join(", "));
                }
            } else {
                resolver.start_order()?;
                print!("{}", serde_yaml::to_string(&project)?);
            }
        }

        Commands::Volumes => {
            let orchestrator = orchestrator(project, settings)?;
            println!("{:<24} {:<10} {:<10} MOUNTPOINT", "VOLUME", "EXTERNAL", "SIZE");
            for volume in orchestrator.volume_status()? {
                let size = volume.size.map(human_size).unwrap_or_else(|| "-".to_string());
                let mountpoint = volume
                    .mountpoint
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not created)".to_string());
                println!(
                    "{:<24} {:<10} {:<10} {}",
                    volume.resource_name, volume.external, size, mountpoint
                );
            }
        }
    }

    Ok(())
}
