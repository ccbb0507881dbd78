use crate::connection::SessionRegistry;
use crate::dispatcher::Dispatcher;
use crate::handler::ConnectionHandler;
use log::*;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept loop for the reliable progress channel.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
}

impl Server {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accepts connections until `shutdown` turns true, then closes every
    /// live connection and waits for their handlers to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local = self
            .listener
            .local_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        info!(
            "Progress server listening on {local} (max {} connections)",
            self.registry.max_connections()
        );

        let mut handlers = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {peer}: {e}");
                        }
                        debug!("Accepted connection from {peer}");

                        let handler = ConnectionHandler::new(
                            Arc::clone(&self.registry),
                            self.dispatcher.clone(),
                            shutdown.clone(),
                            peer.to_string(),
                        );
                        let (reader, writer) = stream.into_split();
                        handlers.spawn(handler.run(reader, writer));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection handler task failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender dropped; treat as shutdown.
                        break;
                    }
                }
            }
        }

        info!("Progress server shutting down");
        drop(self.listener);

        for (user_id, connection_id) in self.registry.connection_ids() {
            self.registry.unregister(&user_id, &connection_id).await;
        }

        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                error!("Connection handler task failed during shutdown: {e}");
            }
        }

        info!("Progress server stopped");
    }
}
