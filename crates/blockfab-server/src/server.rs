//! Server assembly: shared context, acceptor loop, ordered shutdown.
//!
//! The process-wide image table, configuration and alt-server registry are
//! one explicit [`ServerContext`] handed to every subsystem; teardown runs
//! in reverse dependency order (acceptor, sessions, uplinks, integrity,
//! images).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use blockfab_transport::AltServerRegistry;

use crate::client;
use crate::config::ServerConfig;
use crate::image::ImageRegistry;
use crate::integrity::IntegrityChecker;

/// Everything the subsystems share. Replaces global mutable state with one
/// explicit object.
pub struct ServerContext {
    pub config: ServerConfig,
    pub images: ImageRegistry,
    pub altservers: Arc<AltServerRegistry>,
    pub integrity: Arc<IntegrityChecker>,
    pub client_count: AtomicUsize,
}

/// The image server.
pub struct Server;

impl Server {
    /// Loads the image directory, binds the listener and starts accepting.
    pub async fn bind(
        config: ServerConfig,
        altservers: Arc<AltServerRegistry>,
        bind_addr: SocketAddr,
    ) -> crate::Result<ServerHandle> {
        let images = ImageRegistry::new(config.base_path.clone(), config.max_images);
        images.load_all()?;

        let ctx = Arc::new(ServerContext {
            config,
            images,
            altservers,
            integrity: IntegrityChecker::spawn(),
            client_count: AtomicUsize::new(0),
        });

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx.clone(),
            shutdown_rx,
            sessions.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            ctx,
            shutdown_tx,
            accept_task,
            sessions,
        })
    }
}

/// Running server instance.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Stops the server in reverse dependency order.
    pub async fn shutdown(self) {
        info!("shutting down {}", self.local_addr);
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;

        for session in self.sessions.lock().unwrap().drain(..) {
            session.abort();
        }

        self.ctx.images.kill_uplinks();

        if let Some(worker) = self.ctx.integrity.shutdown() {
            worker.abort();
            let _ = worker.await;
        }
        info!("server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        continue;
                    }
                };
                if ctx.client_count.load(Ordering::Acquire) >= ctx.config.max_clients {
                    warn!("rejecting {peer}: client limit reached");
                    continue;
                }
                ctx.client_count.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("nodelay on {peer}: {e}");
                }
                let ctx_clone = ctx.clone();
                let task = tokio::spawn(async move {
                    client::handle_connection(stream, peer, ctx_clone.clone()).await;
                    ctx_clone.client_count.fetch_sub(1, Ordering::AcqRel);
                });
                let mut sessions = sessions.lock().unwrap();
                sessions.retain(|t| !t.is_finished());
                sessions.push(task);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
