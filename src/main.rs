//! sessionpool-echo - Echo server built on the session pool
//!
//! This is the main entry point for the sessionpool-echo application.

use anyhow::Result;
use clap::Parser;
use sessionpool::config::{load_config, Config};
use sessionpool::echo::EchoSessionFactory;
use sessionpool::{ListenOptions, SessionPool, SessionState, TcpTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// sessionpool-echo - Echo server running on a session pool
#[derive(Parser, Debug)]
#[command(name = "sessionpool-echo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'L', long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Close each connection after echoing its first message
    #[arg(long)]
    one_shot: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => Config::default(),
    };

    info!("sessionpool-echo v{}", sessionpool::VERSION);

    let pool = SessionPool::<TcpTransport>::from_config(&config, |state, source, _| {
        warn!("Pool event {:?} (source {:?})", state, source);
    })?;
    pool.start()?;

    let factory = if args.one_shot {
        EchoSessionFactory::one_shot()
    } else {
        EchoSessionFactory::new()
    };
    let listener = pool.listen(
        args.listen,
        Arc::new(factory),
        |state, handle, _session, _user_data| match state {
            SessionState::Up | SessionState::Down => info!("Session {} {:?}", handle, state),
            _ => debug!("Session {} {:?}", handle, state),
        },
        ListenOptions::default(),
    )?;
    info!("Echoing on {}", pool.listen_addr(listener)?);

    wait_for_shutdown().await;

    // Stopping blocks until the workers have drained
    let result = tokio::task::spawn_blocking(move || pool.stop_and_remove_all_sessions()).await?;
    if let Err(e) = result {
        error!("Shutdown finished with error (code {}): {}", e.code(), e);
        std::process::exit(e.code());
    }

    info!("Shut down cleanly");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
