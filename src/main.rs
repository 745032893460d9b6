//! Convoy - A Compose-style multi-container orchestrator
//!
//! CLI entry point: loads the compose project through the pipeline and
//! drives the orchestrator.

use clap::{Parser, Subcommand};
use convoy::compose::{load_project, LoadOptions};
use convoy::error::{ConvoyError, Result};
use convoy::orchestrator::{
    DownOptions, ExecOptions, LogOptions, Orchestrator, PullPolicy, UpOptions,
};
use convoy::project::Project;
use convoy::runtime::{LogStream, RuntimeClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPT: i32 = 130;

/// Convoy - Compose-style multi-container orchestrator
#[derive(Parser)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Run multi-container projects from compose files", long_about = None)]
struct Cli {
    /// Compose file (repeatable; later files override earlier ones)
    #[arg(short, long, global = true)]
    file: Vec<PathBuf>,

    /// Project name (defaults to the directory name)
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Activate a profile (repeatable)
    #[arg(long, global = true)]
    profile: Vec<String>,

    /// Set an interpolation variable KEY=VAL (repeatable)
    #[arg(long, global = true, value_name = "KEY=VAL")]
    env: Vec<String>,

    /// Permit YAML anchors and merge keys
    #[arg(long, global = true)]
    allow_anchors: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start containers
    Up {
        /// Services to start (all when omitted)
        services: Vec<String>,
        /// Run in detached mode
        #[arg(short, long)]
        detach: bool,
        /// Recreate containers even if their configuration is unchanged
        #[arg(long)]
        force_recreate: bool,
        /// Never recreate existing containers
        #[arg(long)]
        no_recreate: bool,
        /// Do not start dependency services
        #[arg(long)]
        no_deps: bool,
        /// Remove containers for services no longer defined
        #[arg(long)]
        remove_orphans: bool,
        /// Remove containers when the foreground run exits
        #[arg(long = "rm")]
        remove_on_exit: bool,
        /// Image pull policy: always, missing, never
        #[arg(long, default_value = "missing")]
        pull: String,
        /// Wait until services are running (and healthy)
        #[arg(long)]
        wait: bool,
        /// Wait deadline in seconds
        #[arg(long)]
        wait_timeout: Option<u64>,
        /// Skip healthchecks and health gates
        #[arg(long)]
        no_healthcheck: bool,
    },

    /// Stop and remove containers
    Down {
        /// Also remove project volumes
        #[arg(short, long)]
        volumes: bool,
        /// Also remove containers matched only by name prefix
        #[arg(long)]
        remove_orphans: bool,
    },

    /// List project containers
    Ps,

    /// Show service logs
    Logs {
        /// Services to show (all when omitted)
        services: Vec<String>,
        /// Follow log output
        #[arg(long)]
        follow: bool,
        /// Show only the last N lines per source
        #[arg(short = 'n', long)]
        tail: Option<usize>,
        /// Prefix lines with timestamps
        #[arg(short, long)]
        timestamps: bool,
        /// Include boot output
        #[arg(long)]
        boot: bool,
    },

    /// Start the project's services
    Start,

    /// Stop the project's services
    Stop,

    /// Restart the project's services
    Restart,

    /// Execute a command in a running service container
    Exec {
        /// Service name
        service: String,
        /// Command to execute
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
        /// Do not wait for the command
        #[arg(short, long)]
        detach: bool,
        /// Keep stdin open
        #[arg(short, long)]
        interactive: bool,
        /// Allocate a pseudo-TTY
        #[arg(short, long)]
        tty: bool,
        /// Run as this user
        #[arg(short, long)]
        user: Option<String>,
        /// Working directory inside the container
        #[arg(short, long)]
        workdir: Option<String>,
        /// Extra environment KEY=VAL (repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VAL")]
        env_vars: Vec<String>,
    },

    /// Run healthchecks and report per-service status
    Health {
        /// Services to check (all when omitted)
        services: Vec<String>,
    },

    /// Parse, merge, and validate the compose files
    Validate,

    /// Remove stopped service containers
    Rm {
        /// Services to remove (all when omitted)
        services: Vec<String>,
        /// Remove running containers too
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let env_overrides = parse_env_pairs(&cli.env)?;
    let load_options = LoadOptions {
        files: cli.file.clone(),
        project_name: cli.project.clone(),
        profiles: cli.profile.clone(),
        services: Vec::new(),
        env_overrides,
        allow_anchors: cli.allow_anchors,
    };
    let project = load_project(&load_options)?;

    if let Commands::Validate = cli.command {
        println!(
            "{}",
            serde_yaml::to_string(&project).map_err(|e| ConvoyError::Yaml(e.to_string()))?
        );
        return Ok(0);
    }

    let orchestrator = Orchestrator::new(RuntimeClient::in_memory());

    match cli.command {
        Commands::Up {
            services,
            detach,
            force_recreate,
            no_recreate,
            no_deps,
            remove_orphans,
            remove_on_exit,
            pull,
            wait,
            wait_timeout,
            no_healthcheck,
        } => {
            let options = UpOptions {
                detach,
                force_recreate,
                no_recreate,
                no_deps,
                remove_orphans,
                remove_on_exit,
                pull_policy: pull.parse::<PullPolicy>()?,
                wait,
                wait_timeout: wait_timeout.map(Duration::from_secs),
                no_healthcheck,
            };
            run_up(&orchestrator, &project, &services, &options).await
        }
        Commands::Down {
            volumes,
            remove_orphans,
        } => {
            let report = orchestrator
                .down(
                    &project,
                    &DownOptions {
                        remove_volumes: volumes,
                        remove_orphans,
                    },
                )
                .await?;
            for id in &report.removed_containers {
                println!("removed container {}", id);
            }
            for name in &report.removed_volumes {
                println!("removed volume {}", name);
            }
            Ok(0)
        }
        Commands::Ps => {
            let entries = orchestrator.ps(&project).await?;
            println!(
                "{:<16} {:<14} {:<28} {:<10} PORTS",
                "SERVICE", "ID", "IMAGE", "STATUS"
            );
            for entry in entries {
                println!(
                    "{:<16} {:<14} {:<28} {:<10} {}",
                    entry.service, entry.short_id, entry.image, entry.status, entry.ports
                );
            }
            Ok(0)
        }
        Commands::Logs {
            services,
            follow,
            tail,
            timestamps,
            boot,
        } => {
            let options = LogOptions {
                follow,
                tail,
                timestamps,
                include_boot: boot,
            };
            let mut rx = orchestrator.logs(&project, &services, &options).await?;
            while let Some(entry) = rx.recv().await {
                print_log_entry(&entry, timestamps);
            }
            Ok(0)
        }
        Commands::Start => {
            orchestrator.start(&project).await?;
            Ok(0)
        }
        Commands::Stop => {
            orchestrator.stop(&project).await?;
            Ok(0)
        }
        Commands::Restart => {
            orchestrator.restart(&project).await?;
            Ok(0)
        }
        Commands::Exec {
            service,
            command,
            detach,
            interactive,
            tty,
            user,
            workdir,
            env_vars,
        } => {
            let options = ExecOptions {
                detach,
                interactive,
                tty,
                user,
                workdir,
                env: parse_env_pairs(&env_vars)?,
            };
            let code = orchestrator.exec(&project, &service, &command, &options).await?;
            Ok(code)
        }
        Commands::Health { services } => {
            let results = orchestrator.check_health(&project, &services).await?;
            let mut failures = false;
            for (service, healthy) in &results {
                println!("{:<24} {}", service, if *healthy { "healthy" } else { "unhealthy" });
                failures |= !healthy;
            }
            Ok(if failures { EXIT_FAILURE } else { 0 })
        }
        Commands::Validate => unreachable!("handled above"),
        Commands::Rm { services, force } => {
            for id in orchestrator.remove(&project, &services, force).await? {
                println!("removed container {}", id);
            }
            Ok(0)
        }
    }
}

async fn run_up(
    orchestrator: &Orchestrator,
    project: &Project,
    services: &[String],
    options: &UpOptions,
) -> Result<i32> {
    orchestrator.up(project, services, options).await?;
    if options.detach {
        return Ok(0);
    }

    // foreground: attach to logs until interrupted
    let log_options = LogOptions {
        follow: true,
        ..Default::default()
    };
    let mut rx = orchestrator.logs(project, services, &log_options).await?;
    let interrupted = foreground_loop(&mut rx).await?;
    drop(rx);

    if interrupted || options.remove_on_exit {
        // first signal: graceful teardown; a second one forces exit
        let down_options = DownOptions::default();
        let down = orchestrator.down(project, &down_options);
        tokio::pin!(down);
        tokio::select! {
            result = &mut down => {
                result?;
            }
            _ = wait_for_signal() => {
                std::process::exit(EXIT_INTERRUPT);
            }
        }
    }
    Ok(if interrupted { EXIT_INTERRUPT } else { 0 })
}

/// Pump log entries until the stream ends or a signal arrives. Returns true
/// when a signal interrupted the stream.
async fn foreground_loop(
    rx: &mut tokio::sync::mpsc::Receiver<convoy::orchestrator::LogEntry>,
) -> Result<bool> {
    let mut signals = Signals::install()?;
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => print_log_entry(&entry, false),
                None => return Ok(false),
            },
            _ = signals.recv() => return Ok(true),
        }
    }
}

async fn wait_for_signal() {
    match Signals::install() {
        Ok(mut signals) => signals.recv().await,
        Err(_) => std::future::pending().await,
    }
}

#[cfg(unix)]
struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_log_entry(entry: &convoy::orchestrator::LogEntry, timestamps: bool) {
    let line = if timestamps {
        format!(
            "{} {:<16}| {}",
            entry.timestamp.to_rfc3339(),
            entry.service,
            entry.message
        )
    } else {
        format!("{:<16}| {}", entry.service, entry.message)
    };
    match entry.stream {
        LogStream::Stdout => println!("{}", line),
        LogStream::Stderr => eprintln!("{}", line),
    }
}

fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    ConvoyError::InvalidArgument(format!("expected KEY=VAL, got '{}'", pair))
                })
        })
        .collect()
}
