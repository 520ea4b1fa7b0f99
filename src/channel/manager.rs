//! Per-party fan-out of state changes to connected clients
//!
//! One `SessionChannel` per party with live subscribers. A forwarder task
//! drains the party's bus subscription into every client's bounded outbound
//! queue; a sweeper destroys channels that go idle, empty past the grace
//! period, or whose party has ended.

use crate::adapters::identity::IdentityVerifier;
use crate::config::ChannelSettings;
use crate::error::{MatchmakingError, Result};
use crate::events::bus::EventBus;
use crate::metrics::MetricsCollector;
use crate::party::machine::PartyRegistry;
use crate::types::{Frame, PartyEvent, PartyId, PartyStatus, PlayerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a client or channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Backpressure,
}

impl CloseReason {
    fn label(self) -> &'static str {
        match self {
            CloseReason::Idle => "idle",
            CloseReason::Backpressure => "backpressure",
        }
    }
}

/// What a connected client holds: its identity and the outbound frame stream
#[derive(Debug)]
pub struct ClientHandle {
    pub client_id: Uuid,
    pub party_id: PartyId,
    pub player_id: PlayerId,
    pub rx: mpsc::Receiver<Frame>,
}

struct SessionChannel {
    party_id: PartyId,
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Frame>>>,
    /// Monotonic sequence across every frame this channel emits
    seq: AtomicU64,
    last_ping: Mutex<Instant>,
    empty_since: Mutex<Option<Instant>>,
    bus_subscription_id: u64,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SessionChannel {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a frame onto every subscriber's outbound queue. Subscribers
    /// whose queue overflows are dropped with reason `backpressure`.
    fn fan_out(&self, event: PartyEvent, metrics: &MetricsCollector) {
        let frame = Frame {
            event,
            seq: self.next_seq(),
        };

        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read().expect("channel lock poisoned");
            for (client_id, tx) in subscribers.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => {
                        metrics.channel().frames_fanned_out_total.inc();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.push((*client_id, CloseReason::Backpressure));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push((*client_id, CloseReason::Idle));
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().expect("channel lock poisoned");
            for (client_id, reason) in dropped {
                if subscribers.remove(&client_id).is_some() {
                    if reason == CloseReason::Backpressure {
                        warn!(
                            "Dropping client {} from party {}: outbound queue overflow",
                            client_id, self.party_id
                        );
                    }
                    metrics
                        .channel()
                        .clients_dropped_total
                        .with_label_values(&[reason.label()])
                        .inc();
                    metrics.channel().connected_clients.dec();
                }
            }
            if subscribers.is_empty() {
                *self.empty_since.lock().expect("channel lock poisoned") = Some(Instant::now());
            }
        }
    }

    /// Send a frame to a single subscriber (connected, pong, error replies)
    fn send_to_client(&self, client_id: Uuid, event: PartyEvent) {
        let frame = Frame {
            event,
            seq: self.next_seq(),
        };
        let subscribers = self.subscribers.read().expect("channel lock poisoned");
        if let Some(tx) = subscribers.get(&client_id) {
            let _ = tx.try_send(frame);
        }
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

/// Manages every live session channel
pub struct SessionChannelManager {
    channels: RwLock<HashMap<PartyId, Arc<SessionChannel>>>,
    bus: Arc<EventBus>,
    identity: Arc<dyn IdentityVerifier>,
    registry: Arc<PartyRegistry>,
    metrics: Arc<MetricsCollector>,
    config: ChannelSettings,
}

impl SessionChannelManager {
    pub fn new(
        bus: Arc<EventBus>,
        identity: Arc<dyn IdentityVerifier>,
        registry: Arc<PartyRegistry>,
        metrics: Arc<MetricsCollector>,
        config: ChannelSettings,
    ) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            bus,
            identity,
            registry,
            metrics,
            config,
        }
    }

    /// Authenticate a credential, check party membership, and register the
    /// client on the party's channel. The first frame the client receives is
    /// `connected`.
    pub async fn attach(&self, party_id: PartyId, credential: &str) -> Result<ClientHandle> {
        let player_id = self.identity.verify(credential).await?;

        let party = self.registry.get_party(party_id)?;
        if party.status == PartyStatus::Ended {
            return Err(MatchmakingError::NotFound {
                kind: "party".to_string(),
                id: party_id.to_string(),
            }
            .into());
        }
        if !party.is_member(&player_id) {
            return Err(MatchmakingError::Forbidden {
                player_id: player_id.clone(),
                party_id: party_id.to_string(),
            }
            .into());
        }

        let channel = self.get_or_create_channel(party_id)?;
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_size);

        {
            let mut subscribers = channel.subscribers.write().expect("channel lock poisoned");
            subscribers.insert(client_id, tx);
        }
        *channel.empty_since.lock().expect("channel lock poisoned") = None;
        *channel.last_ping.lock().expect("channel lock poisoned") = Instant::now();
        self.metrics.channel().connected_clients.inc();

        info!(
            "Client {} ({}) attached to party {} channel",
            client_id, player_id, party_id
        );

        channel.send_to_client(
            client_id,
            PartyEvent::Connected {
                party_id,
                player_id: player_id.clone(),
            },
        );

        Ok(ClientHandle {
            client_id,
            party_id,
            player_id,
            rx,
        })
    }

    /// Remove a client. The channel lingers for the grace period once empty.
    pub fn detach(&self, party_id: PartyId, client_id: Uuid) {
        let Some(channel) = self.channel(party_id) else {
            return;
        };

        let removed = {
            let mut subscribers = channel.subscribers.write().expect("channel lock poisoned");
            let removed = subscribers.remove(&client_id).is_some();
            if removed && subscribers.is_empty() {
                *channel.empty_since.lock().expect("channel lock poisoned") = Some(Instant::now());
            }
            removed
        };

        if removed {
            self.metrics.channel().connected_clients.dec();
            debug!("Client {} detached from party {}", client_id, party_id);
        }
    }

    /// Push an event to every client attached to the party.
    pub fn send_to_party(&self, party_id: PartyId, event: PartyEvent) {
        if let Some(channel) = self.channel(party_id) {
            channel.fan_out(event, &self.metrics);
        }
    }

    /// Refresh the channel's liveness deadline.
    pub fn record_ping(&self, party_id: PartyId) {
        if let Some(channel) = self.channel(party_id) {
            *channel.last_ping.lock().expect("channel lock poisoned") = Instant::now();
        }
    }

    /// Reply to one client's ping.
    pub fn pong(&self, party_id: PartyId, client_id: Uuid) {
        if let Some(channel) = self.channel(party_id) {
            channel.send_to_client(client_id, PartyEvent::Pong);
        }
    }

    /// Send an error frame to one client.
    pub fn send_error(&self, party_id: PartyId, client_id: Uuid, code: &str, message: &str) {
        if let Some(channel) = self.channel(party_id) {
            channel.send_to_client(
                client_id,
                PartyEvent::Error {
                    code: code.to_string(),
                    message: message.to_string(),
                },
            );
        }
    }

    /// Destroy channels that are idle, empty past the grace period, or whose
    /// party has ended. Returns how many were destroyed.
    pub fn sweep(&self) -> usize {
        let ping_interval = std::time::Duration::from_secs(self.config.ping_interval_seconds);
        let grace = std::time::Duration::from_secs(self.config.grace_period_seconds);
        let now = Instant::now();

        let mut to_destroy = Vec::new();
        {
            let channels = self.channels.read().expect("channel lock poisoned");
            for (party_id, channel) in channels.iter() {
                let ended = self
                    .registry
                    .get_party(*party_id)
                    .map(|p| p.status == PartyStatus::Ended)
                    .unwrap_or(true);
                if ended {
                    to_destroy.push((*party_id, "party ended"));
                    continue;
                }

                let stale = now.duration_since(*channel.last_ping.lock().expect("lock"))
                    > ping_interval;
                if stale && channel.subscriber_count() > 0 {
                    to_destroy.push((*party_id, CloseReason::Idle.label()));
                    continue;
                }

                let expired_grace = channel
                    .empty_since
                    .lock()
                    .expect("lock")
                    .map(|since| now.duration_since(since) > grace)
                    .unwrap_or(false);
                if channel.subscriber_count() == 0 && expired_grace {
                    to_destroy.push((*party_id, "empty past grace"));
                }
            }
        }

        let destroyed = to_destroy.len();
        for (party_id, why) in to_destroy {
            info!("Destroying channel for party {}: {}", party_id, why);
            self.destroy_channel(party_id);
        }
        destroyed
    }

    /// Spawn the periodic sweeper task.
    pub fn spawn_sweeper(self: Arc<Self>, sweep_interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                let destroyed = self.sweep();
                if destroyed > 0 {
                    debug!("Channel sweep destroyed {} channels", destroyed);
                }
            }
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn client_count(&self, party_id: PartyId) -> usize {
        self.channel(party_id)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    fn channel(&self, party_id: PartyId) -> Option<Arc<SessionChannel>> {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(&party_id).cloned())
    }

    fn get_or_create_channel(&self, party_id: PartyId) -> Result<Arc<SessionChannel>> {
        if let Some(existing) = self.channel(party_id) {
            return Ok(existing);
        }

        let mut channels = self.channels.write().map_err(|_| MatchmakingError::Internal {
            message: "channel map lock poisoned".to_string(),
        })?;
        if let Some(existing) = channels.get(&party_id) {
            return Ok(existing.clone());
        }

        let mut subscription = self.bus.subscribe(party_id);
        let channel = Arc::new(SessionChannel {
            party_id,
            subscribers: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            last_ping: Mutex::new(Instant::now()),
            empty_since: Mutex::new(None),
            bus_subscription_id: subscription.id(),
            forwarder: Mutex::new(None),
        });

        // Forward the party's bus events into the fan-out until the channel
        // is destroyed (unsubscribing ends the stream)
        let forwarder = {
            let channel = channel.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                while let Some(frame) = subscription.recv().await {
                    channel.fan_out(frame.event, &metrics);
                }
                debug!("Forwarder for party {} finished", channel.party_id);
            })
        };
        *channel.forwarder.lock().expect("channel lock poisoned") = Some(forwarder);

        channels.insert(party_id, channel.clone());
        self.metrics.channel().active_channels.inc();
        info!("Created session channel for party {}", party_id);

        Ok(channel)
    }

    fn destroy_channel(&self, party_id: PartyId) {
        let Some(channel) = ({
            let mut channels = match self.channels.write() {
                Ok(channels) => channels,
                Err(_) => return,
            };
            channels.remove(&party_id)
        }) else {
            return;
        };

        let remaining = channel.subscriber_count() as i64;
        if remaining > 0 {
            self.metrics.channel().connected_clients.sub(remaining);
        }
        channel
            .subscribers
            .write()
            .expect("channel lock poisoned")
            .clear();

        self.bus.unsubscribe(party_id, channel.bus_subscription_id);
        if let Some(forwarder) = channel.forwarder.lock().expect("lock").take() {
            forwarder.abort();
        }
        self.metrics.channel().active_channels.dec();
    }
}
