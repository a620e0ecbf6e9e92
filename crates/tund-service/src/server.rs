//! Control endpoint
//!
//! Serves the control router on a Unix socket or a loopback TCP port
//! and stops it with a bounded deadline.

use crate::config::{ControlConfig, Transport};
use crate::error::ServiceError;
use axum::Router;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Where the control API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// World-writable Unix socket; unix only
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub fn from_config(config: &ControlConfig) -> Self {
        match config.transport {
            Transport::Unix if cfg!(unix) => Endpoint::Unix(config.socket_path.clone()),
            Transport::Unix => {
                warn!("Unix sockets unavailable, using {}", config.tcp_addr);
                Endpoint::Tcp(config.tcp_addr)
            }
            Transport::Tcp => Endpoint::Tcp(config.tcp_addr),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "http://{}", addr),
        }
    }
}

/// A running control server.
pub struct ServerHandle {
    endpoint: Endpoint,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    /// The bound endpoint, with the actual port for TCP.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting and give in-flight requests up to `deadline`.
    pub async fn shutdown(self, deadline: Duration) {
        let ServerHandle {
            endpoint,
            shutdown_tx,
            mut task,
        } = self;
        let _ = shutdown_tx.send(());
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(()))) => info!("Control server stopped"),
            Ok(Ok(Err(e))) => warn!("Control server failed: {}", e),
            Ok(Err(e)) => warn!("Control server task failed: {}", e),
            Err(_) => {
                warn!("Control server did not stop within {:?}, aborting", deadline);
                task.abort();
            }
        }
        if let Endpoint::Unix(path) = &endpoint {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Cannot remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Bind `endpoint` and serve `app` in the background.
pub async fn serve(endpoint: &Endpoint, app: Router) -> Result<ServerHandle, ServiceError> {
    let bind_err = |source| ServiceError::Bind {
        endpoint: endpoint.to_string(),
        source,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let signal = async move {
        let _ = shutdown_rx.await;
    };

    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
            let local = listener.local_addr().map_err(bind_err)?;
            info!("Control API listening on http://{}", local);
            let task = tokio::spawn(async move {
                axum::serve(listener, app).with_graceful_shutdown(signal).await
            });
            Ok(ServerHandle {
                endpoint: Endpoint::Tcp(local),
                shutdown_tx,
                task,
            })
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            use std::os::unix::fs::PermissionsExt;

            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed stale socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(bind_err(e)),
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(bind_err)?;
            }
            let listener = tokio::net::UnixListener::bind(path).map_err(bind_err)?;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
                .await
                .map_err(bind_err)?;
            info!("Control API listening on {}", path.display());
            let task = tokio::spawn(async move {
                axum::serve(listener, app).with_graceful_shutdown(signal).await
            });
            Ok(ServerHandle {
                endpoint: endpoint.clone(),
                shutdown_tx,
                task,
            })
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(bind_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        ))),
    }
}
