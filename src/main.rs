//! Leosac CLI entry point.
//!
//! Provides `run`, `remote`, and `keygen` subcommands for running the kernel,
//! sending one remote control command, or generating a transport key pair.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use leosac::config::codec::{self, ConfigFormat};
use leosac::config::{ConfigStore, RuntimePaths};
use leosac::kernel::{Kernel, KernelHandle};
use leosac::logging::{self, LoggingGuard};
use leosac::message::Message;
use leosac::modules::ModuleRegistry;
use leosac::remote::{commands, request_from_args, KeyPair, RemoteClient, DELAYED};

/// Leosac access-control hub kernel.
#[derive(Parser)]
#[command(name = "leosac", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Boot the kernel and run until stopped.
    Run {
        /// Kernel configuration file.
        #[arg(short, long, default_value = "kernel.toml")]
        config: PathBuf,
    },
    /// Send one remote control command and print the reply.
    Remote {
        /// Endpoint, `host:port`.
        endpoint: String,
        /// Server public key, base64.
        server_pubkey: String,
        /// Command name, e.g. `MODULE_LIST`.
        command: String,
        /// Command arguments.
        args: Vec<String>,
        /// Seconds to wait for a delayed outcome.
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Print a fresh transport key pair.
    Keygen,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => handle_run(&config),
        Command::Remote {
            endpoint,
            server_pubkey,
            command,
            args,
            wait,
        } => handle_remote(&endpoint, &server_pubkey, &command, &args, wait),
        Command::Keygen => handle_keygen(),
    }
}

/// Run the kernel, rebuilding it for as long as it asks for a restart.
fn handle_run(config: &Path) -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let paths = RuntimePaths::from_env();
    let mut logging_guard: Option<LoggingGuard> = None;
    let mut logging_ready = false;

    loop {
        let store = ConfigStore::load(config)
            .with_context(|| format!("failed to load {}", config.display()))?;

        if !logging_ready {
            let log = store.log_settings().context("invalid [log] section")?;
            match &log.directory {
                Some(dir) => logging_guard = Some(logging::init_production(dir, &log.level)?),
                None => logging::init_cli(&log.level),
            }
            logging_ready = true;
        }

        let kernel = Kernel::new(
            store,
            runtime.handle().clone(),
            ModuleRegistry::builtin(),
            paths.clone(),
        )?;
        let signals = runtime.spawn(watch_signals(kernel.handle()));
        let restart = kernel.run();
        signals.abort();

        if !restart? {
            break;
        }
        info!("restarting kernel");
    }

    info!("leosac stopped");
    drop(logging_guard);
    Ok(())
}

/// Turn process signals into kernel requests.
#[cfg(unix)]
async fn watch_signals(handle: KernelHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut hup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        warn!("failed to install signal handlers, only ctrl-c is handled");
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
        return;
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => handle.shutdown(),
            _ = term.recv() => handle.shutdown(),
            _ = hup.recv() => handle.reload(),
        }
    }
}

/// Turn ctrl-c into a kernel shutdown.
#[cfg(not(unix))]
async fn watch_signals(handle: KernelHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        handle.shutdown();
    }
}

/// Send one command and print every reply frame.
fn handle_remote(
    endpoint: &str,
    server_pubkey: &str,
    command: &str,
    args: &[String],
    wait: u64,
) -> anyhow::Result<()> {
    logging::init_cli("warn");
    let request = request_from_args(command, args)?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    runtime.block_on(async {
        let mut client = RemoteClient::connect(endpoint, server_pubkey, None)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        let reply = client.request(&request).await?;
        print_reply(command, &reply);

        if reply.str_at(0) == Some(DELAYED) {
            let outcome = client
                .receive_within(Duration::from_secs(wait))
                .await
                .context("no outcome received")?;
            print_reply(command, &outcome);
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn print_reply(command: &str, reply: &Message) {
    for (index, part) in reply.parts().enumerate() {
        println!("{}", render_frame(command, index, part));
    }
}

fn render_frame(command: &str, index: usize, part: &[u8]) -> String {
    if command == commands::CONFIG_VERSION && index == 1 {
        if let Ok(bytes) = <[u8; 8]>::try_from(part) {
            return u64::from_be_bytes(bytes).to_string();
        }
    }
    if let Ok(text) = std::str::from_utf8(part) {
        if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return text.to_owned();
        }
    }
    match codec::decode(part, ConfigFormat::Binary).and_then(|tree| tree.to_toml()) {
        Ok(toml) => toml,
        Err(_) => format!("<{} bytes>", part.len()),
    }
}

/// Print a new key pair in the form expected by the `[remote]` section.
fn handle_keygen() -> anyhow::Result<()> {
    let keypair = KeyPair::generate()?;
    println!("public_key = \"{}\"", keypair.public_base64());
    println!("secret_key = \"{}\"", keypair.secret_base64());
    Ok(())
}
