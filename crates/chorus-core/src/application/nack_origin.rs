//! NACK originator — coalesces detected gaps into transport-layer NACK
//! feedback sent upstream to the publisher.

use std::sync::Arc;

use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::header::Header;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::domain::clock::{NACK_TICK, PACKET_EXPIRATION};
use crate::domain::loss::{encode_pair, NACK_BATCH};

use super::peer::Peer;
use super::ports::RtcpBatch;

/// Accumulate loss descriptors and flush them upstream.
///
/// A batch flushes once it holds [`NACK_BATCH`] entries, or once the oldest
/// entry has aged about a quarter of the expiration window in media time.
/// A feedback write error ends the loop with the error; the peer stays up
/// until its own paths fail.
pub(crate) async fn originate(
    peer: Arc<Peer>,
    mut losses: mpsc::Receiver<Header>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(NACK_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut lost: Vec<Header> = Vec::new();
    loop {
        tokio::select! {
            _ = peer.closing().cancelled() => return Ok(()),
            received = losses.recv() => match received {
                Some(header) => {
                    lost.push(header);
                    // Drain whatever the same stream step produced, so one
                    // burst coalesces into one report.
                    while let Ok(header) = losses.try_recv() {
                        lost.push(header);
                    }
                }
                None => return Ok(()),
            },
            _ = ticker.tick() => {}
        }

        let Some(first) = lost.first() else { continue };
        let aged = peer.media_timestamp() >= first.timestamp.wrapping_add(PACKET_EXPIRATION / 4);
        if lost.len() < NACK_BATCH && !aged {
            continue;
        }
        let Some(pair) = encode_pair(&lost) else { continue };
        let __peer_label = peer.label().await;
        trace!(
            peer = %__peer_label,
            packet_id = pair.packet_id,
            bitmap = pair.lost_packets,
            "sending nack upstream"
        );
        let feedback = TransportLayerNack {
            sender_ssrc: first.ssrc,
            media_ssrc: first.ssrc,
            nacks: vec![pair],
        };
        let batch: RtcpBatch = vec![Box::new(feedback)];
        peer.transport().write_rtcp(&batch).await?;
        lost.clear();
    }
}
