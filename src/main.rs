//! pages: serve bare Git repositories read-only over FUSE, with an SSH
//! command gateway alongside.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};

mod app_config;
mod sshd;
mod trc;

use crate::app_config::Config;
use pagesfs::{GitFs, GitFsConfig};

#[derive(Parser)]
#[command(
    version,
    about = "Serve bare Git repositories as a read-only filesystem, with an SSH command gateway."
)]
struct Args {
    /// Optional path to a pages config TOML.
    #[arg(short, long, value_parser)]
    config_path: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    // Config loads before tracing exists, so failures go to stderr directly.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(errors) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &errors {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = trc::init(&config.log, config.fuse.debug) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to create tokio runtime");
            std::process::exit(1);
        });
    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "pages failed");
        std::process::exit(1);
    }
}

/// Launch GitFS and the SSH gateway concurrently and wait for a shutdown
/// signal. GitFS serves on a dedicated thread because the FUSE loop blocks.
async fn run(config: Config) -> Result<(), std::io::Error> {
    let gitfs = Arc::new(GitFs::new(GitFsConfig {
        repo_root: config.fuse.repo_root.clone(),
        debug: config.fuse.debug,
    })?);

    let serve_thread = {
        let gitfs = Arc::clone(&gitfs);
        std::thread::spawn(move || gitfs.start())
    };
    gitfs.wait_mounted();
    info!(mountpoint = %gitfs.mountpoint().display(), "GitFS is mounted");

    let mut ssh = sshd::SshServer::new(&config.sshd, Arc::clone(&gitfs))
        .map_err(std::io::Error::other)?;
    let ssh_task = tokio::spawn(async move {
        if let Err(e) = ssh.run().await {
            error!(error = %e, "SSH gateway failed");
        }
    });

    wait_for_exit().await?;

    if let Err(e) = gitfs.unmount() {
        error!(error = %e, "failed to unmount GitFS");
    }
    ssh_task.abort();
    if serve_thread.join().is_err() {
        debug!("FUSE serve thread panicked");
    }
    Ok(())
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("received Ctrl+C, shutting down");
        },
        _ = sigterm.recv() => {
            debug!("received SIGTERM, shutting down");
        },
        _ = sighup.recv() => {
            debug!("received SIGHUP, shutting down");
        },
    }
    Ok(())
}
