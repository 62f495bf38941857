//! Core server: owns the session controller and serves the control surface.
//!
//! Accepts TCP connections carrying line-delimited JSON requests, runs the
//! sweep and snapshot tasks, and drains running sessions on shutdown.

use crate::auth;
use crate::config::ServerConfig;
use crate::control::ControlService;
use crate::persist::{load_snapshot, save_snapshot};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracegate_core::{
    ArtifactNamer, CaptureEngine, ControlResponse, FsArtifactStore, PresetCatalog,
    SessionController, SessionRegistry,
};
use tracing::{debug, error, info, warn};

/// Longest request line accepted from a client.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// The tracegate server instance.
pub struct TracegateServer {
    config: ServerConfig,
    controller: Arc<SessionController>,
    service: Arc<ControlService>,
}

impl TracegateServer {
    /// Create a new server instance, restoring the previous run's sessions.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (tokens, access) = auth::from_principals(&config.principals);
        if tokens.is_empty() {
            warn!("no principals configured, every request will be rejected");
        } else {
            info!(count = tokens.len(), "loaded principals");
        }

        let registry = Arc::new(SessionRegistry::new());
        if let Some(snapshot) = load_snapshot(&config.snapshot_path).await? {
            let restored = registry.restore(snapshot).await;
            info!(count = restored, "restored sessions from snapshot");
        }

        let presets = PresetCatalog::new(config.presets.clone());
        info!(presets = ?presets.names(), "recording presets");

        let controller = SessionController::builder(
            Arc::new(CaptureEngine::new()),
            Arc::new(FsArtifactStore::new(config.artifact_dir.clone())),
            Arc::new(access),
        )
        .registry(registry)
        .policy(config.policy.clone())
        .presets(presets)
        .namer(ArtifactNamer::new(&config.host_id))
        .settings(config.settings.clone())
        .engine_timeouts(config.begin_timeout, config.stop_timeout)
        .build();
        let controller = Arc::new(controller);

        let service = Arc::new(ControlService::new(Arc::clone(&controller), tokens));
        Ok(Self {
            config,
            controller,
            service,
        })
    }

    /// Serve until `shutdown` resolves, then drain and persist.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        info!(addr = %self.config.listen, "control listener started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = self
            .controller
            .spawn_sweeper(self.config.sweep_interval, stop_rx.clone());
        let snapshots = self.spawn_snapshots(stop_rx.clone());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(remote = %addr, "control connection accepted");
                        let service = Arc::clone(&self.service);
                        let stop_rx = stop_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(service, stream, stop_rx).await {
                                debug!(remote = %addr, error = %e, "control connection closed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        if let Err(e) = sweeper.await {
            warn!(error = %e, "sweeper task failed");
        }
        if let Err(e) = snapshots.await {
            warn!(error = %e, "snapshot task failed");
        }

        let drained = self.controller.shutdown().await;
        info!(count = drained.len(), "running sessions drained");
        save_snapshot(&self.config.snapshot_path, &self.controller.registry().snapshot().await).await
    }

    fn spawn_snapshots(&self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self.controller.registry());
        let path = self.config.snapshot_path.clone();
        let period = self.config.snapshot_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = save_snapshot(&path, &registry.snapshot().await).await {
                            warn!(error = %e, "periodic snapshot failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Answer requests on one connection until EOF or shutdown.
pub async fn serve_connection<S>(
    service: Arc<ControlService>,
    stream: S,
    mut stop_rx: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        // One byte past the cap tells an oversized line from a full one.
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read?,
            _ = stop_rx.changed() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }

        if buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
            warn!(limit = MAX_LINE_BYTES, "request line too long, closing connection");
            let response = ControlResponse::error(413, "too_large", "request line too long");
            write_response(&mut writer, &response).await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = service.handle_line(line).await;
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ControlResponse) -> std::io::Result<()> {
    let mut out = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await
}
