//! Fan-out of mutation frames to connected peers
//!
//! Broadcasting is best-effort: a slow or dead peer costs at most the send
//! timeout and is reported in the result, never propagated as an error.
//! Reconciliation via inventory exchange covers whatever a broadcast missed.

use crate::framing::Frame;
use crate::peer::{ConnectionRegistry, PeerId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-transport summary of one broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Peers the frame was offered to
    pub num_peers: usize,
    /// Sends that were accepted by the connection
    pub num_success: usize,
    /// Sends that failed or timed out
    pub num_failures: usize,
    /// Wall time the fan-out took, in milliseconds
    pub elapsed_ms: u64,
}

impl BroadcastResult {
    pub fn merge(&mut self, other: &BroadcastResult) {
        self.num_peers += other.num_peers;
        self.num_success += other.num_success;
        self.num_failures += other.num_failures;
        self.elapsed_ms = self.elapsed_ms.max(other.elapsed_ms);
    }
}

/// Broadcaster over one transport's connection registry.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Send a frame to every connected peer.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastResult {
        self.fan_out(frame, None).await
    }

    /// Send a frame to every connected peer except the one it arrived from.
    /// This is the relay path: the origin already has the data.
    pub async fn re_broadcast(&self, frame: Frame, exclude: PeerId) -> BroadcastResult {
        self.fan_out(frame, Some(exclude)).await
    }

    async fn fan_out(&self, frame: Frame, exclude: Option<PeerId>) -> BroadcastResult {
        let started = Instant::now();
        let connections = self.registry.list();

        let mut result = BroadcastResult::default();
        for conn in connections {
            if exclude == Some(conn.peer) {
                continue;
            }
            result.num_peers += 1;
            let send = conn.send(frame.clone());
            match tokio::time::timeout(self.send_timeout, send).await {
                Ok(Ok(())) => result.num_success += 1,
                Ok(Err(e)) => {
                    warn!(peer = %conn.peer, error = %e, "broadcast send failed");
                    result.num_failures += 1;
                }
                Err(_) => {
                    warn!(peer = %conn.peer, "broadcast send timed out");
                    result.num_failures += 1;
                }
            }
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }
}
