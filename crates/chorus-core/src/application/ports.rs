//! Port traits (interfaces) the forwarding core depends on.
//!
//! Adapters implement these over an established transport; the core never
//! references a concrete WebRTC stack. Signalling, ICE, DTLS, and SRTP have
//! already happened by the time a [`MediaTransport`] is handed over.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;

/// A batch of parsed RTCP packets, as the transport delivers them.
pub type RtcpBatch = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

/// Lifecycle events surfaced by an established peer connection.
///
/// The state changes are observed (logged) only; track arrival is the one
/// event the core acts on.
pub enum TransportEvent {
    SignalingChange(String),
    IceChange(String),
    ConnectionChange(String),
    Track(Arc<dyn RemoteTrack>),
}

/// Abstracts one established peer connection.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Next lifecycle event, or `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Create an outbound local track on this connection.
    async fn new_track(
        &self,
        payload_type: u8,
        ssrc: u32,
        id: &str,
        label: &str,
    ) -> anyhow::Result<Arc<dyn LocalTrack>>;

    /// Emit RTCP feedback upstream to the publisher.
    async fn write_rtcp(&self, packets: &RtcpBatch) -> anyhow::Result<()>;

    /// Tear the connection down. Background loops parked on reads against
    /// this transport get an error and exit. Must be idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// One inbound RTP stream.
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    /// Next inbound packet; `Ok(None)` once the stream has ended.
    async fn read_rtp(&self) -> anyhow::Result<Option<Packet>>;

    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;
}

/// The peer's own outbound RTP stream. Fan-out to subscribers happens
/// through senders held by *other* peers, not here.
#[async_trait]
pub trait LocalTrack: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()>;

    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;
}

/// One outbound RTP sender attached to a subscriber, with its RTCP
/// back-channel.
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// Retransmit one buffered packet. Returns the bytes written.
    async fn send_rtp(&self, header: &Header, payload: &Bytes) -> anyhow::Result<usize>;

    /// Next batch of parsed RTCP from the subscriber.
    async fn read_rtcp(&self) -> anyhow::Result<RtcpBatch>;
}
