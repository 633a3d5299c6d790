//! Receiver coordinator
//!
//! Binds the socket, owns the clock, registry and health counters, spawns
//! the receive stage, the playout stage and the idle-session sweep, and
//! hands the event receivers to the embedder. Stage failures land on a
//! fatal-error channel; the coordinator never rebinds or restarts anything
//! on its own.

use std::sync::Arc;

use log::{error, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::ReceiverConfig;
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventReceivers};
use crate::negotiator::Negotiator;
use crate::pipeline::clock::ReceiverClock;
use crate::pipeline::health::ReceiverHealth;
use crate::pipeline::receiver::playout_stage::PlayoutStage;
use crate::pipeline::receiver::receive_stage::ReceiveStage;
use crate::pipeline::stage::PipelineStage;
use crate::session::registry::SessionRegistry;
use crate::shutdown::ShutdownSignal;

/// Default capacity of the sink and subtitle event channels.
const EVENT_CHANNEL_LEN: usize = 256;

/// Running receiver core
pub struct ReceiverCoordinator {
    config: ReceiverConfig,
    clock: ReceiverClock,
    registry: Arc<SessionRegistry>,
    health: Arc<ReceiverHealth>,
    shutdown: ShutdownSignal,
    socket: Arc<UdpSocket>,
    fatal_rx: mpsc::Receiver<Error>,
}

impl ReceiverCoordinator {
    /// Bind the data-plane socket and start every task. Returns the
    /// coordinator and the event streams the sinks subscribe to.
    ///
    /// Bind failure is core-fatal and surfaces immediately.
    pub async fn start(config: ReceiverConfig) -> Result<(Self, EventReceivers)> {
        let bind_addr = format!("0.0.0.0:{}", config.udp.port);
        let socket = Arc::new(UdpSocket::bind(&bind_addr).await.map_err(|source| {
            Error::Bind {
                addr: bind_addr.clone(),
                source,
            }
        })?);
        info!(
            "receiver core: data plane on {}",
            socket.local_addr().map_err(Error::Socket)?
        );

        let clock = ReceiverClock::new();
        let registry = Arc::new(SessionRegistry::new(
            config.jitter.clone(),
            &config.memory,
            config.subtitles.clone(),
        ));
        let health = Arc::new(ReceiverHealth::new());
        let shutdown = ShutdownSignal::new();
        let (bus, receivers) = EventBus::channel(EVENT_CHANNEL_LEN);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        let mut receive = ReceiveStage::new(
            Arc::clone(&socket),
            Arc::clone(&registry),
            clock,
            Arc::clone(&health),
            shutdown.clone(),
        );
        let receive_fatal = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = receive.run().await {
                error!("{} failed: {}", receive.name(), e);
                let _ = receive_fatal
                    .send(Error::Socket(std::io::Error::other(e.to_string())))
                    .await;
            }
        });

        let mut playout = PlayoutStage::new(
            Arc::clone(&registry),
            clock,
            bus,
            shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = playout.run().await {
                error!("{} failed: {}", playout.name(), e);
            }
        });

        // Idle-session sweep
        let sweep_registry = Arc::clone(&registry);
        let sweep_clock = clock;
        let timeout_ms = config.session.timeout_ms;
        let sweep_every = std::time::Duration::from_millis(config.session.cleanup_interval_ms);
        shutdown.spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                let reaped = sweep_registry.expire_idle(sweep_clock.now_ms(), timeout_ms);
                for (id, stats) in reaped {
                    info!(
                        "session {}: reaped ({} received, {} lost)",
                        id, stats.received, stats.lost
                    );
                }
            }
        });

        Ok((
            Self {
                config,
                clock,
                registry,
                health,
                shutdown,
                socket,
                fatal_rx,
            },
            receivers,
        ))
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn clock(&self) -> ReceiverClock {
        self.clock
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<ReceiverHealth> {
        &self.health
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Address the data plane actually bound (relevant with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.socket.local_addr().map_err(Error::Socket)
    }

    /// Point-in-time statistics for a live session.
    pub fn session_stats(&self, session_id: &str) -> Result<crate::session::SessionStats> {
        self.registry
            .lookup(session_id)
            .map(|s| s.final_stats())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Wait for a core-fatal stage failure. Resolves `None` on clean
    /// shutdown.
    pub async fn fatal_error(&mut self) -> Option<Error> {
        self.fatal_rx.recv().await
    }

    /// Build the control-plane negotiator for this core. The embedder wires
    /// `inbound`/`outbound` to its broker client and spawns the result.
    pub fn negotiator(
        &self,
        inbound: mpsc::Receiver<ControlMessage>,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Result<Negotiator> {
        Ok(Negotiator::new(
            Arc::clone(&self.registry),
            self.clock,
            self.local_addr()?,
            self.config.jitter.target_ms as u32,
            inbound,
            outbound,
            self.shutdown.clone(),
        ))
    }

    /// Abort every session and stop all tasks. In-flight emissions are
    /// dropped cleanly; calling twice is harmless.
    pub fn stop(&self) {
        self.shutdown.cancel();
        for session in self.registry.snapshot() {
            if let Some(stats) = self.registry.deregister(session.id()) {
                info!(
                    "session {}: aborted at shutdown ({} received)",
                    session.id(),
                    stats.received
                );
            }
        }
        info!("receiver core: stopped");
    }
}
