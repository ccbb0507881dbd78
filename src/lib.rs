//! Process wiring for the reading sync fabric.
//!
//! [`Fabric::start`] binds the reliable progress channel (TCP) and the
//! best-effort notification channel (UDP), starts the dispatch worker and
//! returns an [`AppState`] whose `EventPublisher` routes API-layer events into
//! both channels.

use events::EventPublisher;
use log::*;
use notify::{RegistrationTable, ReleaseEventHandler};
use progress::{Dispatcher, ProgressEventHandler, SessionRegistry};
use service::config::Config;
use service::AppState;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Both listeners, the dispatch worker and the handles needed to stop them.
pub struct Fabric {
    app_state: AppState,
    registry: Arc<SessionRegistry>,
    registrations: Arc<RegistrationTable>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tcp_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
    dispatch_worker: JoinHandle<()>,
}

impl Fabric {
    pub async fn start(config: Config) -> io::Result<Self> {
        let registry = Arc::new(SessionRegistry::new(config.max_connections()));
        let (dispatcher, dispatch_worker) =
            Dispatcher::start(Arc::clone(&registry), config.dispatch_queue_capacity());

        let tcp_server =
            progress::Server::bind(config.tcp_addr(), Arc::clone(&registry), dispatcher.clone())
                .await?;
        let tcp_addr = tcp_server.local_addr()?;

        let registrations = Arc::new(RegistrationTable::new());
        let udp_server = notify::Server::bind(
            config.udp_addr(),
            Arc::clone(&registrations),
            config.max_datagram_size,
        )
        .await?;
        let udp_addr = udp_server.local_addr()?;

        let event_publisher = EventPublisher::new()
            .with_handler(Arc::new(ProgressEventHandler::new(dispatcher)))
            .with_handler(Arc::new(ReleaseEventHandler::new(udp_server.notifier())));
        let app_state = AppState::new(config, event_publisher);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tcp_task = tokio::spawn(tcp_server.run(shutdown_rx.clone()));
        let udp_task = tokio::spawn(udp_server.run(shutdown_rx));

        info!("Reading sync fabric started (progress on tcp://{tcp_addr}, notifications on udp://{udp_addr})");

        Ok(Self {
            app_state,
            registry,
            registrations,
            tcp_addr,
            udp_addr,
            shutdown,
            tcp_task,
            udp_task,
            dispatch_worker,
        })
    }

    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        self.app_state.event_publisher()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn registrations(&self) -> &Arc<RegistrationTable> {
        &self.registrations
    }

    /// Bound address of the reliable channel; differs from config when port 0 was requested.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Stops both listeners, disconnects every client and waits for the
    /// dispatch worker to drain its queue.
    pub async fn shutdown(self) {
        let Fabric {
            app_state,
            shutdown,
            tcp_task,
            udp_task,
            dispatch_worker,
            ..
        } = self;

        shutdown.send_replace(true);

        if let Err(e) = tcp_task.await {
            error!("Progress server task failed: {e}");
        }
        if let Err(e) = udp_task.await {
            error!("Notification server task failed: {e}");
        }

        // The worker exits once the last Dispatcher clone, held by the publisher, is gone.
        drop(app_state);
        if let Err(e) = dispatch_worker.await {
            error!("Dispatch worker failed: {e}");
        }

        info!("Reading sync fabric stopped");
    }
}
