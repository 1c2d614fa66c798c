use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use tether::config::{Config, OverflowPolicy};
use tether::server::{Server, Service};
use tether::shell::PtyLauncher;
use tether::telemetry::logging::{self as logctl, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    about = "Persistent shells and multiplexed routes that survive reconnects",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "TETHER_CONFIG",
        value_name = "PATH",
        help = "Config file (defaults to ~/.tether/config.toml)"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: Option<LogLevel>,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon.
    Serve(ServeArgs),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    #[arg(long, value_name = "PATH", help = "Unix socket to listen on")]
    socket: Option<PathBuf>,

    #[arg(long, help = "Serve a single peer over stdin/stdout")]
    stdio: bool,

    #[arg(long, value_enum, help = "What to drop when a route backlog is full")]
    overflow_policy: Option<OverflowPolicy>,

    #[arg(long, value_name = "N", help = "Envelopes each route may queue while unbound")]
    backlog_capacity: Option<usize>,

    #[arg(long, value_name = "PROGRAM", help = "Shell for jobs that do not name a command")]
    shell: Option<String>,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(socket) = &self.socket {
            config.socket_path = Some(socket.clone());
        }
        if let Some(policy) = self.overflow_policy {
            config.router.overflow_policy = policy;
        }
        if let Some(capacity) = self.backlog_capacity {
            config.router.backlog_capacity = capacity;
        }
        if let Some(shell) = &self.shell {
            config.jobs.shell = Some(shell.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("tether: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    let log_config = LogConfig {
        level: cli.logging.level.or(config.log_level).unwrap_or_default(),
        file: cli.logging.file.clone().or_else(|| config.log_file.clone()),
    };
    logctl::init(&log_config).context("configure logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Serve(args) => serve(config, args).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).context("render configuration")?);
            Ok(())
        }
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    args.apply(&mut config);
    let socket = config.socket_path().context("resolve daemon socket path")?;
    let service = Service::new(&config, Arc::new(PtyLauncher))?;
    info!(
        socket = %socket.display(),
        stdio = args.stdio,
        policy = config.router.overflow_policy.as_str(),
        capacity = config.router.backlog_capacity,
        "starting tether daemon"
    );
    Server::new(service, socket, args.stdio).run().await
}
