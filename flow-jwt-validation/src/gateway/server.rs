use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use axum::Router;
use log::{error, info, warn};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::{AbortHandle, JoinHandle},
};

use crate::error::ServerLifecycleError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Externally visible lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running { port: u16 },
    Stopping,
}

enum ServerState {
    Stopped,
    Starting,
    Running {
        port: u16,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Stopping,
}

/// Owns at most one embedded HTTP listener.
///
/// `start` and `stop` are not meant to race each other, but `status`,
/// `is_running` and `port` may be read at any time and always see a whole
/// state.
pub struct GatewayServerManager {
    bind_address: IpAddr,
    state: Mutex<ServerState>,
}

impl Default for GatewayServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayServerManager {
    /// Listens on all interfaces.
    pub fn new() -> Self {
        Self::with_bind_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_bind_address(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            state: Mutex::new(ServerState::Stopped),
        }
    }

    /// Binds `port` (0 picks a free one) and serves `router` until [Self::stop].
    ///
    /// Returns the bound port. Fails when already started; a failed bind
    /// leaves the manager stopped.
    pub async fn start(&self, port: u16, router: Router) -> Result<u16, ServerLifecycleError> {
        {
            let mut state = self.lock();
            match &*state {
                ServerState::Stopped => *state = ServerState::Starting,
                ServerState::Running { port, .. } => {
                    return Err(ServerLifecycleError::AlreadyRunning { port: *port })
                }
                ServerState::Starting | ServerState::Stopping => {
                    return Err(ServerLifecycleError::AlreadyRunning { port })
                }
            }
        }
        let guard = TransitionGuard::new(self);

        let listener = match self.bind(port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Gateway failed to start on port {}: {}", port, e);
                drop(guard);
                return Err(ServerLifecycleError::StartFailed {
                    port,
                    reason: e.to_string(),
                });
            }
        };
        let bound = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Gateway on port {} terminated: {}", bound, e);
            }
        });

        *self.lock() = ServerState::Running {
            port: bound,
            shutdown,
            task,
        };
        guard.disarm();
        info!("Gateway listening on {}:{}", self.bind_address, bound);
        Ok(bound)
    }

    /// Stops the listener; a no-op when nothing runs.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, ServerState::Stopping) {
                ServerState::Running {
                    port,
                    shutdown,
                    task,
                } => Some((port, shutdown, task)),
                other => {
                    *state = other;
                    None
                }
            }
        };
        let Some((port, shutdown, mut task)) = running else {
            return;
        };
        let mut guard = TransitionGuard::new(self);
        guard.task = Some(task.abort_handle());

        let _ = shutdown.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!(
                "Gateway on port {} did not drain within {:?}, aborting",
                port, SHUTDOWN_GRACE
            );
            task.abort();
        }
        drop(guard);
        info!("Gateway on port {} stopped", port);
    }

    pub fn status(&self) -> ServerStatus {
        match &*self.lock() {
            ServerState::Stopped => ServerStatus::Stopped,
            ServerState::Starting => ServerStatus::Starting,
            ServerState::Running { port, .. } => ServerStatus::Running { port: *port },
            ServerState::Stopping => ServerStatus::Stopping,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), ServerStatus::Running { .. })
    }

    /// The bound port while running.
    pub fn port(&self) -> Option<u16> {
        match self.status() {
            ServerStatus::Running { port } => Some(port),
            _ => None,
        }
    }

    async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(self.bind_address, port)).await
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the manager to `Stopped` when a `start` or `stop` future is
/// dropped before it finishes.
struct TransitionGuard<'a> {
    manager: &'a GatewayServerManager,
    task: Option<AbortHandle>,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(manager: &'a GatewayServerManager) -> Self {
        Self {
            manager,
            task: None,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.manager.lock() = ServerState::Stopped;
    }
}

impl Drop for GatewayServerManager {
    fn drop(&mut self) {
        if let ServerState::Running { shutdown, task, .. } =
            std::mem::replace(&mut *self.lock(), ServerState::Stopped)
        {
            let _ = shutdown.send(());
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use futures_util::FutureExt;

    use super::*;

    fn localhost() -> GatewayServerManager {
        GatewayServerManager::with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn router() -> Router {
        Router::new().route("/ping", get(|| async { "pong" }))
    }

    #[tokio::test]
    async fn start_and_stop() {
        let manager = localhost();
        assert_eq!(manager.status(), ServerStatus::Stopped);
        assert_eq!(manager.port(), None);

        let port = manager.start(0, router()).await.unwrap();

        assert!(manager.is_running());
        assert!(port > 0);
        assert_eq!(manager.port(), Some(port));

        manager.stop().await;

        assert!(!manager.is_running());
        assert_eq!(manager.port(), None);
    }

    #[tokio::test]
    async fn double_start_fails() {
        let manager = localhost();
        let port = manager.start(0, router()).await.unwrap();

        let result = manager.start(0, router()).await;

        assert_eq!(result, Err(ServerLifecycleError::AlreadyRunning { port }));
        assert_eq!(manager.port(), Some(port));
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = localhost();
        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn port_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let manager = localhost();

        let result = manager.start(port, router()).await;

        assert!(matches!(
            result,
            Err(ServerLifecycleError::StartFailed { port: p, .. }) if p == port
        ));
        assert_eq!(manager.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn cancelled_stop_leaves_manager_stopped() {
        let manager = localhost();
        manager.start(0, router()).await.unwrap();

        // Dropped after the first poll, while waiting for the listener to drain.
        let _ = manager.stop().now_or_never();

        assert_eq!(manager.status(), ServerStatus::Stopped);
        assert_eq!(manager.port(), None);
        assert!(manager.start(0, router()).await.is_ok());
        manager.stop().await;
        assert_eq!(manager.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let manager = localhost();
        manager.start(0, router()).await.unwrap();
        manager.stop().await;

        assert!(manager.start(0, router()).await.is_ok());
        manager.stop().await;
    }
}
