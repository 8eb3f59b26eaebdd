//! Forwarder — the single owner of ordering policy and the replay ring.
//!
//! Services three events: ingress packets, retransmission requests from
//! subscribers (handled inline so the ring never needs a lock), and an idle
//! timer that doubles as the liveness check on the inbound stream.

use std::sync::Arc;

use rtp::packet::Packet;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::domain::clock::{PACKET_EXPIRATION, READ_TIMEOUT};
use crate::domain::loss::missing_between;
use crate::domain::ring::PacketRing;

use super::peer::{NackRequest, Peer};
use super::ports::LocalTrack;

pub(crate) struct ForwardPipeline {
    peer: Arc<Peer>,
    track: Arc<dyn LocalTrack>,
    ring: PacketRing,
    /// False until the first packet is accepted; the first acceptance seeds
    /// the stream position instead of reporting a gap against the zero state.
    primed: bool,
}

impl ForwardPipeline {
    pub(crate) fn new(peer: Arc<Peer>, track: Arc<dyn LocalTrack>) -> Self {
        Self {
            peer,
            track,
            ring: PacketRing::new(),
            primed: false,
        }
    }

    /// Run until the inbound stream goes quiet.
    ///
    /// Returns an error when neither a packet nor a retransmission request
    /// arrives within [`READ_TIMEOUT`]; the caller reacts by closing the
    /// peer.
    pub(crate) async fn run(
        mut self,
        mut queue: mpsc::Receiver<Packet>,
        mut nacks: mpsc::Receiver<NackRequest>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                Some(request) = nacks.recv() => self.service_nack(request).await,
                Some(packet) = queue.recv() => self.forward_packet(packet).await,
                _ = tokio::time::sleep(READ_TIMEOUT) => {
                    anyhow::bail!("no inbound media for {READ_TIMEOUT:?}");
                }
            }
        }
    }

    /// Apply the acceptance policy, record gaps, and emit the packet.
    ///
    /// Acceptance is by timestamp monotonicity rather than sequence order:
    /// robust to sequence wrap, and late packets may still fill slots of
    /// equal-or-older timestamps without corrupting the most-recent view.
    async fn forward_packet(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;
        let ts = packet.header.timestamp;

        if let Some(held) = self.ring.get(seq) {
            // Stale retransmission of a slot we already hold.
            if held.header.timestamp >= ts {
                return;
            }
        }
        let position = self.peer.media_timestamp();
        if position > ts.wrapping_add(PACKET_EXPIRATION) {
            return;
        }
        if self.primed && position == ts {
            return;
        }
        if !self.primed || ts > position {
            if self.primed {
                let previous = self.peer.media_sequence();
                for header in missing_between(previous, position, &packet) {
                    // Capacity is one NACK window; excess is dropped.
                    if self.peer.lost_sender().try_send(header).is_err() {
                        break;
                    }
                }
            }
            self.peer.set_media_position(ts, seq);
            self.primed = true;
        }

        if let Err(e) = self.track.write_rtp(&packet).await {
            let __peer_label = self.peer.label().await;
            warn!(
                peer = %__peer_label,
                seq,
                error = %e,
                "outbound write failed"
            );
        }
        self.ring.insert(packet);
    }

    /// Replay buffered packets for one subscriber request.
    ///
    /// Requests aimed at a replaced sender generation are dropped; so are
    /// sequences we no longer hold or that have aged past usefulness.
    async fn service_nack(&self, request: NackRequest) {
        let Some(subscription) = self.peer.subscriber(&request.uid).await else {
            return;
        };
        if *subscription.generation() != request.cid {
            return;
        }
        for seq in request.pair.packet_list() {
            let Some(packet) = self.ring.get(seq) else {
                continue;
            };
            let age_limit = packet.header.timestamp.wrapping_add(PACKET_EXPIRATION);
            if self.peer.media_timestamp() > age_limit {
                continue;
            }
            let result = subscription
                .rtp()
                .send_rtp(&packet.header, &packet.payload)
                .await;
            let __peer_label = self.peer.label().await;
            match result {
                Ok(bytes) => trace!(
                    peer = %__peer_label,
                    remote = %request.uid,
                    seq,
                    bytes,
                    "retransmitted"
                ),
                Err(e) => warn!(
                    peer = %__peer_label,
                    remote = %request.uid,
                    seq,
                    error = %e,
                    "retransmission failed"
                ),
            }
        }
    }
}
