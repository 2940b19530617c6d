//! `AgentBus`: two `zmq` sockets tie the Master process to its Worker
//! children — a ROUTER/DEALER pair for commands and heartbeats, and a
//! PUB/SUB pair for broadcast events. `zmq`'s socket API is synchronous,
//! so both sides run their blocking recv loop on a dedicated OS thread
//! (via `spawn_blocking`) and bridge to async callers with `mpsc` channels.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::types::BusEnvelope;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Master-side half of the bus: binds ROUTER for commands/heartbeats and
/// PUB for broadcast events.
pub struct MasterBus {
    router: Arc<zmq::Socket>,
    publisher: Arc<zmq::Socket>,
    #[allow(dead_code)]
    ctx: zmq::Context,
}

impl MasterBus {
    /// `command_endpoint`/`event_endpoint` come from `WorkerConfig`
    /// (defaults are `ipc://` sockets local to one host).
    pub fn bind(command_endpoint: &str, event_endpoint: &str) -> Result<Self> {
        let ctx = zmq::Context::new();
        let router = ctx.socket(zmq::ROUTER).map_err(|e| WorkerError::Bus(e.to_string()))?;
        router.bind(command_endpoint).map_err(|e| WorkerError::Bus(e.to_string()))?;
        let publisher = ctx.socket(zmq::PUB).map_err(|e| WorkerError::Bus(e.to_string()))?;
        publisher.bind(event_endpoint).map_err(|e| WorkerError::Bus(e.to_string()))?;
        Ok(Self { router: Arc::new(router), publisher: Arc::new(publisher), ctx })
    }

    /// Send a command/heartbeat-ack envelope to a specific worker identity
    /// (the ROUTER frame id, assigned by `zmq` on the worker's first send).
    pub async fn send_to(&self, identity: Vec<u8>, envelope: &BusEnvelope) -> Result<()> {
        let json = serde_json::to_vec(envelope)?;
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || {
            router.send_multipart([identity, json], 0).map_err(|e| WorkerError::Bus(e.to_string()))
        })
        .await
        .map_err(|e| WorkerError::Bus(e.to_string()))??;
        Ok(())
    }

    /// Broadcast an event to every subscribed worker.
    pub async fn publish(&self, envelope: &BusEnvelope) -> Result<()> {
        let json = serde_json::to_vec(envelope)?;
        let publisher = self.publisher.clone();
        tokio::task::spawn_blocking(move || {
            publisher.send(json, 0).map_err(|e| WorkerError::Bus(e.to_string()))
        })
        .await
        .map_err(|e| WorkerError::Bus(e.to_string()))??;
        Ok(())
    }

    /// Spawn the blocking ROUTER recv loop; every `(identity, envelope)`
    /// pair it receives is forwarded to the returned channel.
    pub fn spawn_recv_loop(&self) -> mpsc::Receiver<(Vec<u8>, BusEnvelope)> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || loop {
            let parts = match router.recv_multipart(0) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(error = %e, "master bus recv failed, stopping loop");
                    break;
                }
            };
            if parts.len() < 2 {
                continue;
            }
            let identity = parts[0].clone();
            match serde_json::from_slice::<BusEnvelope>(&parts[1]) {
                Ok(envelope) => {
                    if tx.blocking_send((identity, envelope)).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "dropping malformed bus envelope"),
            }
        });
        rx
    }
}

/// Worker-side half: DEALER for commands/heartbeats, SUB for broadcast
/// events.
pub struct WorkerBus {
    dealer: Arc<zmq::Socket>,
    subscriber: Arc<zmq::Socket>,
    #[allow(dead_code)]
    ctx: zmq::Context,
}

impl WorkerBus {
    pub fn connect(command_endpoint: &str, event_endpoint: &str) -> Result<Self> {
        let ctx = zmq::Context::new();
        let dealer = ctx.socket(zmq::DEALER).map_err(|e| WorkerError::Bus(e.to_string()))?;
        dealer.connect(command_endpoint).map_err(|e| WorkerError::Bus(e.to_string()))?;
        let subscriber = ctx.socket(zmq::SUB).map_err(|e| WorkerError::Bus(e.to_string()))?;
        subscriber.connect(event_endpoint).map_err(|e| WorkerError::Bus(e.to_string()))?;
        subscriber.set_subscribe(b"").map_err(|e| WorkerError::Bus(e.to_string()))?;
        Ok(Self { dealer: Arc::new(dealer), subscriber: Arc::new(subscriber), ctx })
    }

    pub async fn send(&self, envelope: &BusEnvelope) -> Result<()> {
        let json = serde_json::to_vec(envelope)?;
        let dealer = self.dealer.clone();
        tokio::task::spawn_blocking(move || dealer.send(json, 0).map_err(|e| WorkerError::Bus(e.to_string())))
            .await
            .map_err(|e| WorkerError::Bus(e.to_string()))??;
        Ok(())
    }

    pub fn spawn_recv_loop(&self) -> mpsc::Receiver<BusEnvelope> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let dealer = self.dealer.clone();
        tokio::task::spawn_blocking(move || loop {
            let bytes = match dealer.recv_bytes(0) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "worker bus recv failed, stopping loop");
                    break;
                }
            };
            match serde_json::from_slice::<BusEnvelope>(&bytes) {
                Ok(envelope) => {
                    if tx.blocking_send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "dropping malformed bus envelope"),
            }
        });
        rx
    }

    pub fn spawn_event_loop(&self) -> mpsc::Receiver<BusEnvelope> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let subscriber = self.subscriber.clone();
        tokio::task::spawn_blocking(move || loop {
            let bytes = match subscriber.recv_bytes(0) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "worker event recv failed, stopping loop");
                    break;
                }
            };
            match serde_json::from_slice::<BusEnvelope>(&bytes) {
                Ok(envelope) => {
                    if tx.blocking_send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "dropping malformed event envelope"),
            }
        });
        rx
    }
}
