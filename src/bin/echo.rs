//! Echo server demo for fiberio
//!
//! Accepts TCP connections and prints whatever the clients send, either as
//! text (`-t`) or as a hex dump (`-b`). Every client is served by its own
//! fiber; all blocking calls go through the hook layer.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use fiberio::config::RuntimeConfig;
use fiberio::net::{TcpListener, TcpStream};
use fiberio::{hook, IoManager};

#[derive(Parser)]
#[command(name = "fiberio-echo")]
#[command(about = "Fiber-per-connection echo server")]
struct Args {
    /// Print received data as text
    #[arg(short = 't', long, conflicts_with = "binary")]
    text: bool,

    /// Print received data as hex
    #[arg(short = 'b', long)]
    binary: bool,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8020")]
    addr: String,

    /// Worker threads, including the main thread
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Configuration file (defaults to the nearest fiberio.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug output
    #[arg(short, long)]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Text,
    Hex,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let filter = std::env::var("FIBERIO_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            let level = if verbose {
                Level::DEBUG
            } else if quiet {
                Level::ERROR
            } else {
                Level::INFO
            };
            EnvFilter::new(level.as_str())
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

fn handle_client(mut client: TcpStream, mode: Mode) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    tracing::info!(%peer, "handle client");

    let mut buf = [0u8; 1024];
    loop {
        match client.read(&mut buf) {
            Ok(0) => {
                tracing::info!(%peer, "client close");
                break;
            }
            Ok(n) => {
                let data = &buf[..n];
                let mut stdout = io::stdout().lock();
                let written = match mode {
                    Mode::Text => stdout.write_all(data),
                    Mode::Hex => writeln!(stdout, "{}", hex::encode(data)),
                };
                if let Err(e) = written.and_then(|()| stdout.flush()) {
                    tracing::warn!("stdout write failed: {e}");
                }
            }
            Err(e) => {
                tracing::info!(%peer, errno = e.raw_os_error(), "client error: {e}");
                break;
            }
        }
    }
}

fn serve(iom: IoManager, addr: String, mode: Mode) {
    tracing::info!(?mode, %addr, "server starting");
    let listener = loop {
        match TcpListener::bind(addr.as_str()) {
            Ok(listener) => break listener,
            Err(e) => {
                tracing::warn!(%addr, "bind failed, retrying: {e}");
                hook::sleep(2);
            }
        }
    };

    loop {
        match listener.accept() {
            Ok((client, _)) => iom.schedule(move || handle_client(client, mode)),
            Err(e) => {
                tracing::error!("accept failed: {e}");
                break;
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    if !args.text && !args.binary {
        eprintln!("used as [fiberio-echo -t] or [fiberio-echo -b]");
        return Ok(());
    }
    let mode = if args.binary { Mode::Hex } else { Mode::Text };

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path).context("Failed to load config")?,
        None => RuntimeConfig::find_and_load(&std::env::current_dir()?)
            .context("Failed to load config")?,
    };
    config.scheduler.threads = args.threads;
    config.scheduler.use_caller = true;
    hook::configure(&config.hook);

    let iom = IoManager::with_config(&config).context("Failed to start I/O manager")?;
    let server = iom.clone();
    let addr = args.addr;
    iom.schedule(move || serve(server, addr, mode));
    iom.stop();

    Ok(())
}
