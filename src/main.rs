#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use mcmd::remote::auth::{self, SharedCredentialCache};
use mcmd::remote::client::SshConnector;
use mcmd::remote::config::RunSettings;
use mcmd::remote::known_hosts::HostKeyPolicy;
use mcmd::remote::output::{self, LINES_CHANNEL_CAPACITY};
use mcmd::remote::{Coordinator, FatalError, hostfile};

/// Run one shell command on every host of a host file.
#[derive(Debug, Parser)]
#[command(name = "mcmd", version, about)]
struct Cli {
    /// Host file path, or the name of a host file in the mcmd config directory
    config: String,

    /// Command to run; the words are joined with single spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    // Host failures are warnings and errors; keep normal output clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mcmd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), FatalError> {
    let loaded = hostfile::load(&cli.config)?;
    let settings = RunSettings::from_env();
    let policy = HostKeyPolicy::from_settings(&settings)?;

    let credentials = loaded.config.credentials();
    let cache = Arc::new(SharedCredentialCache::new());
    let chain = auth::resolve(&credentials, &cache);
    if chain.is_empty() {
        warn!("No authentication methods configured in {:?}", loaded.path);
    }

    let pty = settings.pty.clone();
    let connector = Arc::new(SshConnector::new(
        credentials.user.clone(),
        chain,
        policy,
        settings,
    ));
    let command = cli.command.join(" ");
    let mut coordinator = Coordinator::new(connector, loaded.hosts, command, pty);

    let (lines_tx, lines_rx) = mpsc::channel(LINES_CHANNEL_CAPACITY);
    let printer = tokio::spawn(output::print_lines(lines_rx, tokio::io::stdout()));

    let report = coordinator.run(lines_tx, ctrl_c()).await;
    if report.interrupted {
        printer.abort();
        exit_interrupted(&cache);
    }

    // Flushing a large backlog can take a while, Ctrl-C still applies.
    match output::finish_printing(printer, ctrl_c()).await {
        None => exit_interrupted(&cache),
        Some(Ok(written)) => debug!("Printed {} line(s)", written),
        Some(Err(e)) => warn!("Failed to write output: {}", e),
    }
    println!("{}", report.summary_line());
    Ok(())
}

/// Completes on Ctrl-C, or never if the signal cannot be watched.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Leave after an interrupt with the terminal usable again.
///
/// A password prompt may still hold a blocking thread, so the process exits
/// instead of waiting for the runtime to shut down.
fn exit_interrupted(cache: &SharedCredentialCache) -> ! {
    if cache.restore_terminal() {
        debug!("Interrupted during the password prompt");
    }
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout);
    let _ = stdout.flush();
    std::process::exit(0)
}
