//! Peer transport: channel lifecycle, liveness and RTT over the datagram
//! socket.
//!
//! One transport serves one engine and tracks every remote peer in the
//! session. It owns the socket (single writer) and the wire codec.
//! Responsibilities:
//!
//! - encoding outbound messages and decoding inbound datagrams, surfacing
//!   malformed ones as protocol violations rather than swallowing them,
//! - routing inbound messages to per-peer state and surfacing the
//!   simulation-relevant ones ([`TransportEvent`]),
//! - answering pings and recording RTT samples (1 Hz probes),
//! - keepalives, so silence is distinguishable from loss,
//! - the interruption ladder: a reported disconnect starts a grace window
//!   (default 3 s, the step loop keeps running); if the channel is still
//!   down when it expires the engine is told to pause while reconnection is
//!   attempted; if reconnection doesn't land within its timeout (default
//!   10 s) the peer is reported lost and the session ends.
//!
//! The channel-establishment handshake itself (SDP, ICE candidates, the
//! restart renegotiation) is the deployment's concern and flows over the
//! signaling relay; the transport only consumes its verdicts via
//! [`PeerTransport::channel_state_changed`]. The initiator of any
//! renegotiation is deterministic: the participant with the lexicographically
//! smaller id.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

use web_time::{Duration, Instant};

#[cfg(test)]
use crate::network::messages::InputFrame;
use crate::network::messages::{InputBundle, PeerMessage};
use crate::network::socket::DatagramSocket;
use crate::network::stats::NetworkStats;
use crate::network::wire::{self, WireError};
use crate::{Digest8, Frame, ParticipantIndex};

/// Timing configuration for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Interval between RTT pings per peer.
    ///
    /// Default: 1 s
    pub ping_interval: Duration,
    /// Idle time after which a keepalive is sent.
    ///
    /// Default: 200 ms
    pub keepalive_interval: Duration,
    /// How long a reported disconnect may last before the engine is asked to
    /// pause.
    ///
    /// Default: 3 s
    pub grace_window: Duration,
    /// How long reconnection may take after the grace window before the peer
    /// is reported lost.
    ///
    /// Default: 10 s
    pub reconnect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(200),
            grace_window: Duration::from_secs(3),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for high-latency links: longer grace and reconnect windows.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            grace_window: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }
}

/// Externally reported channel condition, in ICE vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCondition {
    /// The channel is connected and usable.
    Connected,
    /// The channel dropped but may come back (ICE `disconnected`).
    Disconnected,
    /// The channel is unrecoverable (ICE `failed`).
    Failed,
}

/// Lifecycle state of one peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel establishment in progress; nothing usable yet.
    Connecting,
    /// Channel open; simulation traffic flows.
    Open,
    /// A disconnect was reported; inside the grace window, still running.
    Grace {
        /// When the disconnect was reported.
        since: Instant,
    },
    /// Grace expired; engine paused, reconnection in progress.
    Reconnecting {
        /// When reconnection started (= grace expiry).
        since: Instant,
    },
    /// The channel is gone for good.
    Lost,
    /// Closed deliberately at episode end.
    Closed,
}

impl ChannelState {
    /// Whether simulation traffic can be sent right now.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::Grace { .. })
    }
}

/// Simulation-relevant happenings surfaced by [`PeerTransport::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An input bundle arrived.
    Inputs {
        /// Sending peer.
        from: ParticipantIndex,
        /// The bundled input frames.
        inputs: InputBundle,
    },
    /// A state digest arrived.
    PeerDigest {
        /// Sending peer.
        from: ParticipantIndex,
        /// The confirmed frame.
        frame: Frame,
        /// The digest.
        digest: Digest8,
    },
    /// The peer finished resetting for the episode.
    EpisodeReady {
        /// Sending peer.
        from: ParticipantIndex,
        /// The peer's seed, as a consistency check.
        seed: u32,
        /// The peer's start frame.
        start_frame: Frame,
    },
    /// The peer reached its final frame.
    EpisodeEnd {
        /// Sending peer.
        from: ParticipantIndex,
        /// The peer's final frame.
        final_frame: Frame,
    },
    /// A peer sent a datagram the wire codec rejects (unknown tag,
    /// truncated layout). This is a protocol violation: the session ends.
    Malformed {
        /// Sending peer.
        from: ParticipantIndex,
        /// What the codec objected to.
        error: WireError,
    },
    /// Grace expired: pause the step loop while reconnection runs.
    Interrupted {
        /// Affected peer.
        peer: ParticipantIndex,
    },
    /// The channel came back after an interruption: resume.
    Resumed {
        /// Affected peer.
        peer: ParticipantIndex,
    },
    /// The channel is gone; end the session with `peer_disconnected`.
    Lost {
        /// Affected peer.
        peer: ParticipantIndex,
    },
}

#[derive(Debug)]
struct PeerEndpoint<A> {
    addr: A,
    state: ChannelState,
    last_ping_at: Option<Instant>,
    last_send_at: Option<Instant>,
    /// Outstanding pings by echoed timestamp.
    outstanding_pings: BTreeMap<u64, Instant>,
    stats: NetworkStats,
}

/// The engine's single handle on its peers.
#[derive(Debug)]
pub struct PeerTransport<A, S>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    socket: S,
    config: TransportConfig,
    peers: BTreeMap<ParticipantIndex, PeerEndpoint<A>>,
    by_addr: BTreeMap<A, ParticipantIndex>,
    epoch: Instant,
    scratch: Vec<u8>,
}

impl<A, S> PeerTransport<A, S>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    /// Creates a transport over `socket`.
    #[must_use]
    pub fn new(socket: S, config: TransportConfig) -> Self {
        Self {
            socket,
            config,
            peers: BTreeMap::new(),
            by_addr: BTreeMap::new(),
            epoch: Instant::now(),
            scratch: Vec::new(),
        }
    }

    /// Registers a remote peer. The channel starts out
    /// [`ChannelState::Connecting`].
    pub fn add_peer(&mut self, index: ParticipantIndex, addr: A) {
        self.by_addr.insert(addr.clone(), index);
        self.peers.insert(
            index,
            PeerEndpoint {
                addr,
                state: ChannelState::Connecting,
                last_ping_at: None,
                last_send_at: None,
                outstanding_pings: BTreeMap::new(),
                stats: NetworkStats::new(),
            },
        );
    }

    /// The registered peer indices.
    #[must_use]
    pub fn peer_indices(&self) -> Vec<ParticipantIndex> {
        self.peers.keys().copied().collect()
    }

    /// Current channel state for a peer.
    #[must_use]
    pub fn channel_state(&self, index: ParticipantIndex) -> Option<ChannelState> {
        self.peers.get(&index).map(|peer| peer.state)
    }

    /// `true` when every registered peer channel is open.
    #[must_use]
    pub fn all_open(&self) -> bool {
        !self.peers.is_empty() && self.peers.values().all(|peer| peer.state.is_open())
    }

    /// Network stats for a peer.
    #[must_use]
    pub fn stats(&self, index: ParticipantIndex) -> Option<&NetworkStats> {
        self.peers.get(&index).map(|peer| &peer.stats)
    }

    /// Applies an externally reported channel condition (data-channel open,
    /// ICE disconnected/failed). Returns events the engine must handle.
    pub fn channel_state_changed(
        &mut self,
        index: ParticipantIndex,
        condition: ChannelCondition,
        now: Instant,
    ) -> Vec<TransportEvent> {
        let Some(peer) = self.peers.get_mut(&index) else {
            return Vec::new();
        };
        match condition {
            ChannelCondition::Connected => match peer.state {
                ChannelState::Connecting => {
                    peer.state = ChannelState::Open;
                    tracing::debug!(peer = %index, "peer channel open");
                    Vec::new()
                },
                ChannelState::Grace { .. } => {
                    // Recovered inside the grace window; the engine never
                    // noticed.
                    peer.state = ChannelState::Open;
                    Vec::new()
                },
                ChannelState::Reconnecting { .. } => {
                    peer.state = ChannelState::Open;
                    tracing::info!(peer = %index, "peer channel recovered");
                    vec![TransportEvent::Resumed { peer: index }]
                },
                _ => Vec::new(),
            },
            ChannelCondition::Disconnected => match peer.state {
                ChannelState::Open => {
                    peer.state = ChannelState::Grace { since: now };
                    tracing::debug!(peer = %index, "peer channel disconnected; grace window started");
                    Vec::new()
                },
                _ => Vec::new(),
            },
            ChannelCondition::Failed => {
                peer.state = ChannelState::Lost;
                tracing::warn!(peer = %index, "peer channel failed");
                vec![TransportEvent::Lost { peer: index }]
            },
        }
    }

    /// Drains the socket, services liveness, advances the interruption
    /// ladder, and returns the events the engine must process this tick.
    pub fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        for (addr, payload) in self.socket.receive_all() {
            let Some(&index) = self.by_addr.get(&addr) else {
                tracing::warn!(?addr, "datagram from unknown address dropped");
                continue;
            };
            let message = match wire::decode(&payload) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(peer = %index, %error, "malformed datagram");
                    events.push(TransportEvent::Malformed { from: index, error });
                    continue;
                },
            };
            let Some(peer) = self.peers.get_mut(&index) else {
                continue;
            };
            peer.stats.messages_received += 1;
            match message {
                PeerMessage::InputBundle(inputs) => {
                    events.push(TransportEvent::Inputs {
                        from: index,
                        inputs,
                    });
                },
                PeerMessage::Ping { timestamp_ms } => {
                    peer.stats.messages_sent += 1;
                    peer.last_send_at = Some(now);
                    wire::encode(&PeerMessage::Pong { timestamp_ms }, &mut self.scratch);
                    self.socket.send_to(&self.scratch, &peer.addr);
                },
                PeerMessage::Pong { timestamp_ms } => {
                    if let Some(sent_at) = peer.outstanding_pings.remove(&timestamp_ms) {
                        let rtt = now.saturating_duration_since(sent_at);
                        peer.stats.record_rtt(rtt.as_millis() as u64);
                    }
                },
                PeerMessage::Keepalive => {},
                PeerMessage::EpisodeEnd { final_frame } => {
                    events.push(TransportEvent::EpisodeEnd {
                        from: index,
                        final_frame,
                    });
                },
                PeerMessage::EpisodeReady { seed, start_frame } => {
                    events.push(TransportEvent::EpisodeReady {
                        from: index,
                        seed,
                        start_frame,
                    });
                },
                PeerMessage::FrameDigest { frame, digest } => {
                    events.push(TransportEvent::PeerDigest {
                        from: index,
                        frame,
                        digest,
                    });
                },
            }
        }

        // Liveness and the interruption ladder.
        for (&index, peer) in &mut self.peers {
            match peer.state {
                ChannelState::Open => {
                    let ping_due = peer.last_ping_at.map_or(true, |at| {
                        now.saturating_duration_since(at) >= self.config.ping_interval
                    });
                    if ping_due {
                        let timestamp_ms =
                            now.saturating_duration_since(self.epoch).as_millis() as u64;
                        peer.outstanding_pings.insert(timestamp_ms, now);
                        peer.last_ping_at = Some(now);
                        peer.last_send_at = Some(now);
                        peer.stats.pings_sent += 1;
                        peer.stats.messages_sent += 1;
                        wire::encode(&PeerMessage::Ping { timestamp_ms }, &mut self.scratch);
                        self.socket.send_to(&self.scratch, &peer.addr);
                    } else {
                        let idle = peer.last_send_at.map_or(true, |at| {
                            now.saturating_duration_since(at) >= self.config.keepalive_interval
                        });
                        if idle {
                            peer.last_send_at = Some(now);
                            peer.stats.keepalives_sent += 1;
                            peer.stats.messages_sent += 1;
                            wire::encode(&PeerMessage::Keepalive, &mut self.scratch);
                            self.socket.send_to(&self.scratch, &peer.addr);
                        }
                    }
                },
                ChannelState::Grace { since } => {
                    if now.saturating_duration_since(since) >= self.config.grace_window {
                        peer.state = ChannelState::Reconnecting { since: now };
                        tracing::info!(peer = %index, "grace window expired; pausing for reconnection");
                        events.push(TransportEvent::Interrupted { peer: index });
                    }
                },
                ChannelState::Reconnecting { since } => {
                    if now.saturating_duration_since(since) >= self.config.reconnect_timeout {
                        peer.state = ChannelState::Lost;
                        tracing::warn!(peer = %index, "reconnection timed out; peer lost");
                        events.push(TransportEvent::Lost { peer: index });
                    }
                },
                _ => {},
            }
        }

        events
    }

    /// Sends an input bundle to a peer. Returns `false` when the channel is
    /// not open — the caller then falls back to the signaling relay.
    pub fn send_inputs(&mut self, index: ParticipantIndex, inputs: InputBundle) -> bool {
        self.send_if_open(index, &PeerMessage::InputBundle(inputs))
    }

    /// Sends a frame digest. Returns `false` when the channel is not open.
    pub fn send_digest(&mut self, index: ParticipantIndex, frame: Frame, digest: Digest8) -> bool {
        self.send_if_open(index, &PeerMessage::FrameDigest { frame, digest })
    }

    /// Sends the episode-ready gate message.
    pub fn send_episode_ready(
        &mut self,
        index: ParticipantIndex,
        seed: u32,
        start_frame: Frame,
    ) -> bool {
        self.send_if_open(index, &PeerMessage::EpisodeReady { seed, start_frame })
    }

    /// Sends the episode-end marker.
    pub fn send_episode_end(&mut self, index: ParticipantIndex, final_frame: Frame) -> bool {
        self.send_if_open(index, &PeerMessage::EpisodeEnd { final_frame })
    }

    /// Closes a peer channel deliberately (end-of-episode flush + close).
    pub fn close(&mut self, index: ParticipantIndex) {
        if let Some(peer) = self.peers.get_mut(&index) {
            peer.state = ChannelState::Closed;
        }
    }

    fn send_if_open(&mut self, index: ParticipantIndex, message: &PeerMessage) -> bool {
        let Some(peer) = self.peers.get_mut(&index) else {
            return false;
        };
        if !peer.state.is_open() {
            return false;
        }
        peer.stats.messages_sent += 1;
        peer.last_send_at = Some(Instant::now());
        wire::encode(message, &mut self.scratch);
        self.socket.send_to(&self.scratch, &peer.addr);
        true
    }
}
