//! In-memory, channel-backed implementations of the transport ports.
//!
//! [`MemoryTransport::pair`] yields the core-facing transport plus a
//! [`MemoryTransportHandle`] playing the far side: inject lifecycle events
//! and inbound RTP, observe forwarded RTP and emitted RTCP feedback.
//! The scenario tests run against this adapter; embedders can use it as the
//! reference for wiring a real WebRTC stack.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    LocalTrack, MediaTransport, RemoteTrack, RtcpBatch, RtpSender, TransportEvent,
};
use crate::domain::clock::OPUS_PAYLOAD_TYPE;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Core-facing side of an in-memory peer connection.
pub struct MemoryTransport {
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound_tx: mpsc::UnboundedSender<Packet>,
    feedback_tx: mpsc::UnboundedSender<RtcpBatch>,
    closed: CancellationToken,
}

/// Far side of an in-memory peer connection.
pub struct MemoryTransportHandle {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Packets the core wrote to its outbound local track.
    pub forwarded: mpsc::UnboundedReceiver<Packet>,
    /// RTCP feedback the core emitted upstream.
    pub feedback: mpsc::UnboundedReceiver<RtcpBatch>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Build a connected transport/handle pair.
    pub fn pair() -> (Arc<Self>, MemoryTransportHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let transport = Arc::new(Self {
            events: Mutex::new(events_rx),
            outbound_tx,
            feedback_tx,
            closed: closed.clone(),
        });
        let handle = MemoryTransportHandle {
            events_tx,
            forwarded: outbound_rx,
            feedback: feedback_rx,
            closed,
        };
        (transport, handle)
    }
}

#[async_trait]
impl MediaTransport for MemoryTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        let mut events = self.events.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            event = events.recv() => event,
        }
    }

    async fn new_track(
        &self,
        payload_type: u8,
        ssrc: u32,
        id: &str,
        label: &str,
    ) -> anyhow::Result<Arc<dyn LocalTrack>> {
        if self.closed.is_cancelled() {
            anyhow::bail!("transport closed");
        }
        Ok(Arc::new(MemoryLocalTrack {
            payload_type,
            ssrc,
            id: id.to_owned(),
            label: label.to_owned(),
            sink: self.outbound_tx.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn write_rtcp(&self, packets: &RtcpBatch) -> anyhow::Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("transport closed");
        }
        let copy: RtcpBatch = packets.iter().map(|p| p.cloned()).collect();
        self.feedback_tx
            .send(copy)
            .map_err(|_| anyhow::anyhow!("feedback receiver dropped"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl MemoryTransportHandle {
    /// Inject a lifecycle event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Announce an inbound Opus track; returns the feed to push packets
    /// through. Dropping the feed ends the track's stream.
    pub fn publish_opus_track(&self, ssrc: u32) -> mpsc::UnboundedSender<Packet> {
        self.publish_track(OPUS_PAYLOAD_TYPE, ssrc)
    }

    /// Announce an inbound track with an arbitrary payload type.
    pub fn publish_track(&self, payload_type: u8, ssrc: u32) -> mpsc::UnboundedSender<Packet> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let track = Arc::new(MemoryRemoteTrack {
            payload_type,
            ssrc,
            feed: Mutex::new(feed_rx),
            closed: self.closed.clone(),
        });
        self.emit(TransportEvent::Track(track));
        feed_tx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolve once the core closes the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

/// Inbound track fed by the handle.
pub struct MemoryRemoteTrack {
    payload_type: u8,
    ssrc: u32,
    feed: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: CancellationToken,
}

#[async_trait]
impl RemoteTrack for MemoryRemoteTrack {
    async fn read_rtp(&self) -> anyhow::Result<Option<Packet>> {
        let mut feed = self.feed.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => anyhow::bail!("transport closed"),
            packet = feed.recv() => Ok(packet),
        }
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

/// Outbound track writing into the handle's `forwarded` stream.
pub struct MemoryLocalTrack {
    payload_type: u8,
    ssrc: u32,
    id: String,
    label: String,
    sink: mpsc::UnboundedSender<Packet>,
    closed: CancellationToken,
}

impl MemoryLocalTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl LocalTrack for MemoryLocalTrack {
    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("transport closed");
        }
        self.sink
            .send(packet.clone())
            .map_err(|_| anyhow::anyhow!("forwarded receiver dropped"))
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

// ---------------------------------------------------------------------------
// RTP sender
// ---------------------------------------------------------------------------

/// Core-facing side of one outbound sender attached to a subscriber.
pub struct MemoryRtpSender {
    rtcp: Mutex<mpsc::UnboundedReceiver<RtcpBatch>>,
    sent_tx: mpsc::UnboundedSender<(Header, Bytes)>,
}

/// Far side of a [`MemoryRtpSender`].
pub struct MemoryRtpSenderHandle {
    /// Feed RTCP (e.g. NACKs) as if sent by the subscriber.
    pub rtcp_tx: mpsc::UnboundedSender<RtcpBatch>,
    /// Packets retransmitted through this sender.
    pub sent: mpsc::UnboundedReceiver<(Header, Bytes)>,
}

impl MemoryRtpSender {
    pub fn pair() -> (Arc<Self>, MemoryRtpSenderHandle) {
        let (rtcp_tx, rtcp_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let sender = Arc::new(Self {
            rtcp: Mutex::new(rtcp_rx),
            sent_tx,
        });
        let handle = MemoryRtpSenderHandle {
            rtcp_tx,
            sent: sent_rx,
        };
        (sender, handle)
    }
}

#[async_trait]
impl RtpSender for MemoryRtpSender {
    async fn send_rtp(&self, header: &Header, payload: &Bytes) -> anyhow::Result<usize> {
        self.sent_tx
            .send((header.clone(), payload.clone()))
            .map_err(|_| anyhow::anyhow!("sender handle dropped"))?;
        Ok(payload.len())
    }

    async fn read_rtcp(&self) -> anyhow::Result<RtcpBatch> {
        match self.rtcp.lock().await.recv().await {
            Some(batch) => Ok(batch),
            None => anyhow::bail!("rtcp stream ended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_unblocks_event_and_track_readers() {
        let (transport, handle) = MemoryTransport::pair();
        let feed = {
            let (feed_tx, feed_rx) = mpsc::unbounded_channel::<Packet>();
            let track = MemoryRemoteTrack {
                payload_type: OPUS_PAYLOAD_TYPE,
                ssrc: 1,
                feed: Mutex::new(feed_rx),
                closed: handle.closed.clone(),
            };
            transport.close().await.unwrap();
            transport.close().await.unwrap();
            assert!(track.read_rtp().await.is_err());
            feed_tx
        };
        drop(feed);
        assert!(transport.next_event().await.is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn local_track_records_outbound_packets() {
        let (transport, mut handle) = MemoryTransport::pair();
        let track = transport.new_track(OPUS_PAYLOAD_TYPE, 7, "gen", "alice").await.unwrap();
        track.write_rtp(&Packet::default()).await.unwrap();
        let seen = handle.forwarded.recv().await.unwrap();
        assert_eq!(seen.header.sequence_number, 0);
        assert_eq!(track.payload_type(), OPUS_PAYLOAD_TYPE);
        assert_eq!(track.ssrc(), 7);
    }
}
