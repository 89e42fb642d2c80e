//! Operator controls: process signals and the pid file.

use anyhow::{Context, Result};
use lib_board::core::{Registry, ShutdownReason};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What an operator signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminSignal {
    /// SIGUSR2
    RotationMarker,
    /// SIGHUP
    ClearCaches,
    /// SIGINT
    ResetState,
    /// SIGQUIT, SIGTERM, or Ctrl-C off unix
    Shutdown(&'static str),
}

/// Carries out one operator request against the running board.
pub async fn apply(registry: &Registry, signal: AdminSignal) {
    match signal {
        AdminSignal::RotationMarker => {
            info!("==== log rotation marker ({}) ====", chrono::Utc::now().to_rfc3339());
        }
        AdminSignal::ClearCaches => {
            let delivered = registry.clear_client_caches();
            info!("Client cache clear delivered to {} sessions", delivered);
        }
        AdminSignal::ResetState => {
            warn!("Full state reset requested");
            registry.full_state_reset().await;
        }
        AdminSignal::Shutdown(name) => {
            info!("{} received, initiating shutdown.", name);
            registry.begin_shutdown(ShutdownReason::Requested(name.to_string()));
        }
    }
}

/// Listens for operator signals until shutdown begins.
pub fn spawn_signal_listener(registry: Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen(&registry).await {
            error!("Signal listener failed: {:#}", e);
            registry.terminate(format!("signal listener failed: {}", e));
        }
    })
}

#[cfg(unix)]
async fn listen(registry: &Registry) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr2 = signal(SignalKind::user_defined2()).context("SIGUSR2 handler")?;
    let mut hup = signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let mut int = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let mut term = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let shutdown = registry.shutdown_token();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = usr2.recv() => AdminSignal::RotationMarker,
            _ = hup.recv() => AdminSignal::ClearCaches,
            _ = int.recv() => AdminSignal::ResetState,
            _ = quit.recv() => AdminSignal::Shutdown("SIGQUIT"),
            _ = term.recv() => AdminSignal::Shutdown("SIGTERM"),
        };
        apply(registry, request).await;
    }
}

#[cfg(not(unix))]
async fn listen(registry: &Registry) -> Result<()> {
    let shutdown = registry.shutdown_token();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Ctrl-C handler")?;
            apply(registry, AdminSignal::Shutdown("Ctrl-C")).await;
        }
    }
    Ok(())
}

/// Removes the pid file when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", path.display()))?;
        info!("Wrote pid file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_logic::testing::registry;

    #[test]
    fn test_pid_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.pid");
        let pid_file = PidFile::write(&path).unwrap();
        let contents = fs::read_to_string(pid_file.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        drop(pid_file);
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_state_drops_sessions() {
        let registry = registry();
        registry.sessions().create(None);
        apply(&registry, AdminSignal::ResetState).await;
        assert!(registry.sessions().is_empty());
        assert!(!registry.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_records_signal_name() {
        let registry = registry();
        apply(&registry, AdminSignal::ClearCaches).await;
        apply(&registry, AdminSignal::Shutdown("SIGTERM")).await;
        assert!(registry.shutdown_token().is_cancelled());
        assert_eq!(
            registry.shutdown_reason(),
            Some(ShutdownReason::Requested("SIGTERM".to_string()))
        );
    }
}
