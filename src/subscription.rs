// subscription.rs — one multiplexed stream per leader (spec §4.D).
//
// Grounded on the teacher's `ingestor::connect_and_listen`: same outer
// reconnect-with-backoff loop, same stall-watcher idea (there: a polled
// `AtomicBool` checked every 5s against a buffer timestamp; here: an inline
// 60s-silence timer per leader, since each leader's reconnect is independent
// rather than one shared global flag). The per-leader bounded queue and its
// backpressure-drop metric are new — the teacher only ever buffered into one
// shared in-memory book, never fanned out to a downstream consumer that
// could fall behind.

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::gateway::{ExchangeClient, UserEvent, UserFill};
use crate::model::Address;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_QUEUE_DEPTH: usize = 1_000;

/// A leader fill handed downstream to the Dispatcher, tagged with the leader
/// so a single fan-in channel can serve every subscribed leader.
#[derive(Debug, Clone)]
pub struct LeaderFill {
    pub leader: Address,
    pub fill: UserFill,
}

struct LeaderStream {
    healthy: AtomicBool,
    last_message_at_ms: AtomicU64,
    cancel: tokio::sync::watch::Sender<bool>,
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Maintains exactly one logical stream per leader with ≥1 active follower,
/// reconnecting with exponential backoff and discarding the stream's initial
/// snapshot. Fills are forwarded to a single fan-in channel consumed by the
/// Leader-Trade Dispatcher.
pub struct SubscriptionManager {
    gateway: Arc<dyn ExchangeClient>,
    streams: DashMap<Address, Arc<LeaderStream>>,
    out_tx: mpsc::Sender<LeaderFill>,
    queue_depth: usize,
}

impl SubscriptionManager {
    pub fn new(gateway: Arc<dyn ExchangeClient>, queue_depth: usize) -> (Self, mpsc::Receiver<LeaderFill>) {
        let depth = if queue_depth == 0 { DEFAULT_QUEUE_DEPTH } else { queue_depth };
        let (out_tx, out_rx) = mpsc::channel(depth);
        (Self { gateway, streams: DashMap::new(), out_tx, queue_depth: depth }, out_rx)
    }

    /// Subscribes to `leader`'s fill stream if not already subscribed.
    /// Single-subscription guarantee: a second call for the same leader is a no-op.
    pub fn subscribe(self: &Arc<Self>, leader: Address) {
        if self.streams.contains_key(&leader) {
            return;
        }
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let handle = Arc::new(LeaderStream { healthy: AtomicBool::new(false), last_message_at_ms: AtomicU64::new(now_ms()), cancel: cancel_tx });
        self.streams.insert(leader.clone(), handle.clone());

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_leader_loop(leader, handle, cancel_rx).await;
        });
    }

    /// Closes the stream for `leader` (spec: last follower removed).
    pub fn unsubscribe(&self, leader: &str) {
        if let Some((_, handle)) = self.streams.remove(leader) {
            let _ = handle.cancel.send(true);
        }
    }

    /// Tears down and re-establishes `leader`'s stream. Called by the
    /// Governor's health-check job (spec §4.D: "reports ... to a governor
    /// that restarts unhealthy streams").
    pub fn force_reconnect(self: &Arc<Self>, leader: &Address) {
        self.unsubscribe(leader);
        self.subscribe(leader.clone());
    }

    pub fn is_subscribed(&self, leader: &str) -> bool {
        self.streams.contains_key(leader)
    }

    /// `{leader: healthy}` report for the governor's restart-unhealthy-streams job.
    pub fn health_report(&self) -> std::collections::HashMap<Address, bool> {
        self.streams.iter().map(|e| (e.key().clone(), e.value().healthy.load(Ordering::Relaxed))).collect()
    }

    async fn run_leader_loop(self: Arc<Self>, leader: Address, handle: Arc<LeaderStream>, mut cancel_rx: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if *cancel_rx.borrow() {
                return;
            }
            match self.gateway.stream_user(&leader).await {
                Ok(rx) => {
                    backoff = BACKOFF_BASE;
                    handle.healthy.store(true, Ordering::Relaxed);
                    let stalled = self.drain_stream(&leader, &handle, rx, &mut cancel_rx).await;
                    handle.healthy.store(false, Ordering::Relaxed);
                    if *cancel_rx.borrow() {
                        return;
                    }
                    if stalled {
                        log::warn!("[SUBSCRIPTION] leader={} stream stalled, forcing reconnect", leader);
                    }
                }
                Err(e) => {
                    log::warn!("[SUBSCRIPTION] leader={} connect failed: {}", leader, e);
                    handle.healthy.store(false, Ordering::Relaxed);
                }
            }
            let jittered = backoff + Duration::from_millis(rand::thread_rng().gen_range(0..250));
            tokio::select! {
                _ = tokio::time::sleep(jittered) => {}
                _ = cancel_rx.changed() => { if *cancel_rx.borrow() { return; } }
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Returns `true` if the loop exited because of a silence timeout
    /// (stall), `false` if the underlying stream closed or was cancelled.
    async fn drain_stream(
        &self,
        leader: &str,
        handle: &Arc<LeaderStream>,
        mut rx: mpsc::Receiver<crate::gateway::StreamEnvelope<UserEvent>>,
        cancel_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) -> bool {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                maybe_env = rx.recv() => {
                    match maybe_env {
                        Some(env) => {
                            handle.last_message_at_ms.store(now_ms(), Ordering::Relaxed);
                            if env.is_snapshot {
                                log::debug!("[SUBSCRIPTION] leader={} discarding initial snapshot", leader);
                                continue;
                            }
                            if let UserEvent::Fill(fill) = env.payload {
                                self.forward(leader, fill).await;
                            }
                        }
                        None => return false,
                    }
                }
                _ = heartbeat.tick() => {
                    let silence = now_ms().saturating_sub(handle.last_message_at_ms.load(Ordering::Relaxed));
                    if silence > STALL_TIMEOUT.as_millis() as u64 {
                        return true;
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() { return false; }
                }
            }
        }
    }

    async fn forward(&self, leader: &str, fill: UserFill) {
        match self.out_tx.try_send(LeaderFill { leader: leader.to_string(), fill }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[SUBSCRIPTION] leader={} queue (depth={}) full, dropping fill (at-most-once)", leader, self.queue_depth);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("[SUBSCRIPTION] dispatcher channel closed, leader={} fill lost", leader);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimGateway;
    use crate::model::MetadataSnapshot;

    #[tokio::test]
    async fn subscribe_is_idempotent_single_subscription() {
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let (mgr, _rx) = SubscriptionManager::new(gw, 10);
        let mgr = Arc::new(mgr);
        mgr.subscribe("0xLEADER".to_string());
        mgr.subscribe("0xLEADER".to_string());
        assert_eq!(mgr.streams.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_stream_entry() {
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let (mgr, _rx) = SubscriptionManager::new(gw, 10);
        let mgr = Arc::new(mgr);
        mgr.subscribe("0xLEADER".to_string());
        mgr.unsubscribe("0xLEADER");
        assert!(!mgr.is_subscribed("0xLEADER"));
    }
}
