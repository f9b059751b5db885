//! PageLink CLI - Share a library and read it from another machine
//!
//! Usage:
//!   pagelink host <path>          Share a directory, print an offer
//!   pagelink join [offer]         Answer an offer and mirror the library
//!   pagelink config               Print a sample configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pagelink_core::{Config, Role};
use pagelink_daemon::{
    ClientPeer, FsDir, HostPeer, Library, QuicTransport, RemoteLibrary, Session,
};

#[derive(Parser)]
#[command(name = "pagelink")]
#[command(about = "Peer-to-peer reading sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "PAGELINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a directory of pages or a directory of episodes
    Host {
        /// Path to share
        path: PathBuf,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Join a session from the host's offer
    Join {
        /// Offer string (read from stdin when omitted)
        offer: Option<String>,

        /// Episode to open
        #[arg(short, long, default_value = "0")]
        episode: u32,

        /// Download every file of the episode into this directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print a sample configuration
    Config {
        /// Print the default config path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Host { path, port, bind } => run_host(config, path, port, bind).await,
        Commands::Join {
            offer,
            episode,
            out,
        } => run_join(config, offer, episode, out).await,
        Commands::Config { path } => {
            if path {
                match Config::default_path() {
                    Some(path) => println!("{}", path.display()),
                    None => bail!("no config directory on this platform"),
                }
            } else {
                print!("{}", Config::sample());
            }
            Ok(())
        }
    }
}

async fn read_line(prompt: &str) -> Result<String> {
    eprintln!("{}", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading stdin")?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("no input");
    }
    Ok(line)
}

async fn run_host(
    mut config: Config,
    path: PathBuf,
    port: Option<u16>,
    bind: Option<IpAddr>,
) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("resolving {}", path.display()))?;
    if !path.is_dir() {
        bail!("not a directory: {}", path.display());
    }
    if let Some(port) = port {
        config.network.port = port;
    }
    if let Some(bind) = bind {
        config.network.bind = bind;
    }

    let library = Library::detect(Arc::new(FsDir::new(&path))).await?;
    info!("Sharing {:?} as {:?}", path, library.kind());

    let (transport, events) =
        QuicTransport::new(config.network.clone(), config.transfer.max_message_size);
    let offer = transport.create_offer()?;
    if let Some(addr) = transport.local_addr() {
        info!("Listening on {}", addr);
    }

    println!("{}", offer);
    let answer = read_line("Paste the answer from the joining peer:").await?;
    transport.accept_answer(&answer)?;

    let host = Arc::new(HostPeer::new(library, config.transfer.preview_size));
    let session = Session::new(Role::Host, transport, config);

    tokio::select! {
        result = session.clone().run(events, host) => {
            if let Err(e) = result {
                error!("Session error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            session.close();
        }
    }

    Ok(())
}

async fn run_join(
    config: Config,
    offer: Option<String>,
    episode: u32,
    out: Option<PathBuf>,
) -> Result<()> {
    let offer = match offer {
        Some(offer) => offer,
        None => read_line("Paste the offer from the host:").await?,
    };

    let (transport, events) =
        QuicTransport::new(config.network.clone(), config.transfer.max_message_size);
    let answer = transport.accept_offer(&offer)?;
    println!("{}", answer);

    let client = Arc::new(ClientPeer::new(config.transfer.preview_size));
    let session = Session::new(Role::Client, transport, config);
    let runner = tokio::spawn(session.clone().run(events, client.clone()));

    let library = tokio::select! {
        library = client.wait_library() => library,
        _ = signal::ctrl_c() => {
            session.close();
            return Ok(());
        }
    };

    let result = tokio::select! {
        result = browse(&library, episode, out) => result,
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    };

    session.close();
    if let Err(e) = runner.await {
        error!("Session task failed: {}", e);
    }
    result
}

async fn browse(library: &RemoteLibrary, episode: u32, out: Option<PathBuf>) -> Result<()> {
    let summary = library.wait_summary().await?;
    println!("{:?}: {}", summary.kind, summary.title);
    if let Some(episodes) = &summary.episodes {
        for (i, name) in episodes.iter().enumerate() {
            println!("  [{}] {}", i, name.name);
        }
    } else {
        println!("  {}", summary.episode);
    }

    let meta = library.request_episode(episode).await?;
    println!("Episode {} \"{}\": {} files", episode, meta.name, meta.length);

    let previews = library.get_abstract_sequence().await?;
    info!("Received {} previews", previews.len());

    let Some(out) = out else {
        return Ok(());
    };
    tokio::fs::create_dir_all(&out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    for index in 0..meta.length {
        let data = library.get_file(index).await?;
        let target = out.join(index.to_string());
        tokio::fs::write(&target, &data)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        info!("Saved {} ({} bytes)", target.display(), data.len());
    }
    Ok(())
}
