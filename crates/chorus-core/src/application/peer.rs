//! The per-participant session anchor.
//!
//! One [`Peer`] per connected participant. It terminates the inbound Opus
//! track, forwards accepted packets through its own outbound track, keeps a
//! replay ring for retransmission, NACKs upstream gaps, and answers NACKs
//! from downstream subscribers. Five activities cooperate around it: a
//! one-shot connection watchdog, the ingress reader, the forwarder, the NACK
//! originator, and one RTCP reader loop per attached outbound sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use rtp::header::Header;
use rtp::packet::Packet;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::clock::{
    CONNECT_TIMEOUT, LOST_CAPACITY, NACK_CAPACITY, OPUS_PAYLOAD_TYPE, QUEUE_CAPACITY,
};
use crate::domain::identity::{ConnectionId, RoomId, UserId};

use super::forward::ForwardPipeline;
use super::ingress;
use super::nack_origin;
use super::ports::{LocalTrack, MediaTransport, RemoteTrack, RtpSender, TransportEvent};

/// One attached RTP stream, stamped with the remote peer's connection
/// generation at attach time. Used for both directions: entries of
/// `publishers` describe streams this peer ingests, entries of `subscribers`
/// describe streams it fans out.
#[derive(Clone)]
pub struct Subscription {
    id: ConnectionId,
    rtp: Arc<dyn RtpSender>,
}

impl Subscription {
    pub fn new(id: ConnectionId, rtp: Arc<dyn RtpSender>) -> Self {
        Self { id, rtp }
    }

    /// The connection generation this subscription was attached under.
    pub fn generation(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn rtp(&self) -> &Arc<dyn RtpSender> {
        &self.rtp
    }
}

/// A retransmission request from a subscriber, tagged with the sender
/// generation it was aimed at so requests against a replaced sender can be
/// dropped.
#[derive(Debug, Clone)]
pub struct NackRequest {
    pub uid: UserId,
    pub cid: ConnectionId,
    pub pair: NackPair,
}

/// State behind the peer's read/write lock.
struct Shared {
    cid: ConnectionId,
    track: Option<Arc<dyn LocalTrack>>,
    publishers: HashMap<UserId, Subscription>,
    subscribers: HashMap<UserId, Subscription>,
}

/// Receivers handed to the copy loop when the first track arrives.
struct Inbox {
    queue: mpsc::Receiver<Packet>,
    nacks: mpsc::Receiver<NackRequest>,
    losses: mpsc::Receiver<Header>,
}

pub struct Peer {
    rid: RoomId,
    uid: UserId,
    transport: Arc<dyn MediaTransport>,
    shared: RwLock<Shared>,
    /// Highest accepted RTP timestamp. Written only by the forwarder;
    /// other readers tolerate a one-step-stale value.
    timestamp: AtomicU32,
    /// Sequence number of the most recent in-order packet.
    sequence: AtomicU16,
    queue_tx: mpsc::Sender<Packet>,
    lost_tx: mpsc::Sender<Header>,
    nack_tx: mpsc::Sender<NackRequest>,
    connected_tx: mpsc::Sender<()>,
    inbox: Mutex<Option<Inbox>>,
    closing: CancellationToken,
}

impl Peer {
    /// Construct the peer and start its background activities.
    ///
    /// Must be called within a tokio runtime. The watchdog closes the peer
    /// if no inbound track arrives within [`CONNECT_TIMEOUT`].
    pub fn build(rid: RoomId, uid: UserId, transport: Arc<dyn MediaTransport>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (lost_tx, lost_rx) = mpsc::channel(LOST_CAPACITY);
        let (nack_tx, nack_rx) = mpsc::channel(NACK_CAPACITY);
        let (connected_tx, connected_rx) = mpsc::channel(1);

        let cid = ConnectionId::generate();
        info!(room = %rid, user = %uid, generation = %cid, "building peer");

        let peer = Arc::new(Self {
            rid,
            uid,
            transport,
            shared: RwLock::new(Shared {
                cid,
                track: None,
                publishers: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            timestamp: AtomicU32::new(0),
            sequence: AtomicU16::new(0),
            queue_tx,
            lost_tx,
            nack_tx,
            connected_tx,
            inbox: Mutex::new(Some(Inbox {
                queue: queue_rx,
                nacks: nack_rx,
                losses: lost_rx,
            })),
            closing: CancellationToken::new(),
        });

        tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.watchdog(connected_rx).await }
        });
        tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.dispatch_events().await }
        });

        peer
    }

    pub fn room_id(&self) -> &RoomId {
        &self.rid
    }

    pub fn user_id(&self) -> &UserId {
        &self.uid
    }

    /// The current connection generation ([`ConnectionId::closed`] once the
    /// peer is down). The room manager stamps subscriptions with this value.
    pub async fn connection_id(&self) -> ConnectionId {
        self.shared.read().await.cid.clone()
    }

    /// Composite `room:user:generation` label used in logs.
    pub async fn label(&self) -> String {
        let shared = self.shared.read().await;
        format!("{}:{}:{}", self.rid, self.uid, shared.cid)
    }

    // -----------------------------------------------------------------------
    // Room-manager surface
    // -----------------------------------------------------------------------

    /// Record the inbound subscription this peer owns against `uid`.
    pub async fn attach_publisher(&self, uid: UserId, subscription: Subscription) {
        self.shared.write().await.publishers.insert(uid, subscription);
    }

    pub async fn detach_publisher(&self, uid: &UserId) -> Option<Subscription> {
        self.shared.write().await.publishers.remove(uid)
    }

    /// Record the outbound subscription fanning this peer's media to `uid`.
    pub async fn attach_subscriber(&self, uid: UserId, subscription: Subscription) {
        self.shared.write().await.subscribers.insert(uid, subscription);
    }

    pub async fn detach_subscriber(&self, uid: &UserId) -> Option<Subscription> {
        self.shared.write().await.subscribers.remove(uid)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Tear the peer down: clear the outbound track, stamp the generation
    /// tombstone, close the underlying connection. Idempotent; dependent
    /// loops exit at their next I/O call.
    pub async fn close(&self) -> anyhow::Result<()> {
        let __peer_label = self.label().await;
        info!(peer = %__peer_label, "closing peer");
        {
            let mut shared = self.shared.write().await;
            shared.track = None;
            shared.cid = ConnectionId::closed();
        }
        self.closing.cancel();
        let result = self.transport.close().await;
        let __peer_label = self.label().await;
        match &result {
            Ok(()) => info!(peer = %__peer_label, "peer closed"),
            Err(e) => warn!(peer = %__peer_label, error = %e, "peer closed with transport error"),
        }
        result
    }

    async fn watchdog(self: Arc<Self>, mut connected: mpsc::Receiver<()>) {
        match tokio::time::timeout(CONNECT_TIMEOUT, connected.recv()).await {
            Ok(_) => {}
            Err(_) => {
                let __peer_label = self.label().await;
                warn!(peer = %__peer_label, "no media within the connection timeout");
                if let Err(e) = self.close().await {
                    let __peer_label = self.label().await;
                    warn!(peer = %__peer_label, error = %e, "close after watchdog expiry failed");
                }
            }
        }
    }

    async fn dispatch_events(self: Arc<Self>) {
        while let Some(event) = self.transport.next_event().await {
            match event {
                TransportEvent::SignalingChange(state) => {
                    let __peer_label = self.label().await;
                    debug!(peer = %__peer_label, %state, "signaling state changed");
                }
                TransportEvent::IceChange(state) => {
                    let __peer_label = self.label().await;
                    debug!(peer = %__peer_label, %state, "ice state changed");
                }
                TransportEvent::ConnectionChange(state) => {
                    let __peer_label = self.label().await;
                    debug!(peer = %__peer_label, %state, "connection state changed");
                }
                TransportEvent::Track(remote) => {
                    let peer = Arc::clone(&self);
                    tokio::spawn(async move { peer.accept_track(remote).await });
                }
            }
        }
    }

    /// Track-arrival policy: exactly one inbound track per peer, Opus only;
    /// anything else drops silently. Acceptance releases the watchdog,
    /// creates the outbound track, and runs the copy loop; when the copy
    /// loop returns — for any reason — the peer is closed.
    async fn accept_track(self: Arc<Self>, remote: Arc<dyn RemoteTrack>) {
        let payload_type = remote.payload_type();
        let ssrc = remote.ssrc();
        let __peer_label = self.label().await;
        info!(peer = %__peer_label, payload_type, ssrc, "inbound track");

        if payload_type != OPUS_PAYLOAD_TYPE {
            let __peer_label = self.label().await;
            debug!(peer = %__peer_label, payload_type, "dropping non-opus track");
            return;
        }
        if self.shared.read().await.track.is_some() {
            return;
        }

        // Release the watchdog. It may already have fired; never block.
        let _ = self.connected_tx.try_send(());

        let (local, inbox) = {
            let mut shared = self.shared.write().await;
            if shared.track.is_some() {
                return;
            }
            let local = match self
                .transport
                .new_track(payload_type, ssrc, shared.cid.as_str(), self.uid.as_str())
                .await
            {
                Ok(track) => track,
                Err(e) => {
                    let __peer_label = self.label().await;
                    warn!(peer = %__peer_label, error = %e, "outbound track creation failed");
                    drop(shared);
                    if let Err(e) = self.close().await {
                        let __peer_label = self.label().await;
                        warn!(peer = %__peer_label, error = %e, "close after track failure failed");
                    }
                    return;
                }
            };
            shared.track = Some(Arc::clone(&local));
            (local, self.inbox.lock().await.take())
        };
        let Some(inbox) = inbox else { return };

        let result = self.copy_track(remote, local, inbox).await;
        let __peer_label = self.label().await;
        match &result {
            Ok(()) => info!(peer = %__peer_label, payload_type, ssrc, "inbound track ended"),
            Err(e) => {
                info!(peer = %__peer_label, payload_type, ssrc, error = %e, "inbound track ended")
            }
        }
        if let Err(e) = self.close().await {
            let __peer_label = self.label().await;
            warn!(peer = %__peer_label, error = %e, "close after track end failed");
        }
    }

    /// Wire the three media activities together and run the forwarder to
    /// completion.
    async fn copy_track(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteTrack>,
        local: Arc<dyn LocalTrack>,
        inbox: Inbox,
    ) -> anyhow::Result<()> {
        let Inbox {
            queue,
            nacks,
            losses,
        } = inbox;

        tokio::spawn({
            let peer = Arc::clone(self);
            let feed = self.queue_tx.clone();
            async move {
                if let Err(e) = ingress::pump(remote, feed).await {
                    let __peer_label = peer.label().await;
                    warn!(peer = %__peer_label, error = %e, "ingress reader ended");
                }
            }
        });
        tokio::spawn({
            let peer = Arc::clone(self);
            async move {
                if let Err(e) = nack_origin::originate(Arc::clone(&peer), losses).await {
                    let __peer_label = peer.label().await;
                    warn!(peer = %__peer_label, error = %e, "nack originator ended");
                }
            }
        });

        ForwardPipeline::new(Arc::clone(self), local)
            .run(queue, nacks)
            .await
    }

    // -----------------------------------------------------------------------
    // RTCP (per outbound sender)
    // -----------------------------------------------------------------------

    /// Read RTCP from one attached outbound sender until error, queueing a
    /// [`NackRequest`] per transport-layer NACK pair. Started by the room
    /// manager for every sender it attaches; other RTCP types are ignored.
    pub async fn loop_rtcp(&self, uid: &UserId, sender: &Subscription) -> anyhow::Result<()> {
        loop {
            let batch = match sender.rtp().read_rtcp().await {
                Ok(batch) => batch,
                Err(e) => {
                    let __peer_label = self.label().await;
                    info!(
                        peer = %__peer_label,
                        remote = %uid,
                        generation = %sender.generation(),
                        error = %e,
                        "rtcp loop ended"
                    );
                    return Err(e);
                }
            };
            for packet in batch {
                let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() else {
                    continue;
                };
                for pair in &nack.nacks {
                    let __peer_label = self.label().await;
                    trace!(
                        peer = %__peer_label,
                        remote = %uid,
                        packet_id = pair.packet_id,
                        bitmap = pair.lost_packets,
                        "nack from subscriber"
                    );
                    let request = NackRequest {
                        uid: uid.clone(),
                        cid: sender.generation().clone(),
                        pair: pair.clone(),
                    };
                    if self.nack_tx.try_send(request).is_err() {
                        let __peer_label = self.label().await;
                        warn!(peer = %__peer_label, remote = %uid, "nack queue full, dropping");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared-state accessors for the activities
    // -----------------------------------------------------------------------

    pub(crate) fn media_timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn media_sequence(&self) -> u16 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn set_media_position(&self, timestamp: u32, sequence: u16) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
        self.sequence.store(sequence, Ordering::Relaxed);
    }

    pub(crate) fn lost_sender(&self) -> &mpsc::Sender<Header> {
        &self.lost_tx
    }

    pub(crate) async fn subscriber(&self, uid: &UserId) -> Option<Subscription> {
        self.shared.read().await.subscribers.get(uid).cloned()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::adapters::memory::{MemoryRtpSender, MemoryTransport};
    use crate::application::ports::RtcpBatch;
    use crate::domain::clock::AUDIO_FRAME_TICKS;

    const SSRC: u32 = 0xAABB;

    fn opus_packet(seq: u16, ts: u32) -> Packet {
        let mut p = Packet::default();
        p.header.payload_type = OPUS_PAYLOAD_TYPE;
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.header.ssrc = SSRC;
        p.payload = Bytes::from_static(&[0xF8, 0xFF, 0xFE]);
        p
    }

    /// Timestamp of the i-th 20 ms frame of the test stream.
    fn ts(i: u16) -> u32 {
        10_000 + u32::from(i) * AUDIO_FRAME_TICKS
    }

    fn build_peer(transport: Arc<MemoryTransport>) -> Arc<Peer> {
        Peer::build(RoomId::new("room"), UserId::new("alice"), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_in_order_media_without_feedback() {
        let (transport, mut handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        for i in 0..100u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }
        for i in 0..100u16 {
            let forwarded = handle.forwarded.recv().await.unwrap();
            assert_eq!(forwarded.header.sequence_number, 1000 + i);
            assert_eq!(forwarded.header.timestamp, ts(i));
            assert_eq!(forwarded.header.ssrc, SSRC);
            assert_eq!(forwarded.payload.as_ref(), &[0xF8, 0xFF, 0xFE]);
        }
        assert_eq!(peer.media_timestamp(), ts(99));
        assert_eq!(peer.media_sequence(), 1099);
        assert!(handle.feedback.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn single_loss_produces_one_nack() {
        let (transport, mut handle) = MemoryTransport::pair();
        let _peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        for i in 0..=49u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }
        // 1050 never arrives; the stream runs on long enough for the gap to
        // age past the flush threshold in media time.
        for i in 51..=70u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }

        let batch = handle.feedback.recv().await.unwrap();
        let nack = batch[0]
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .unwrap();
        assert_eq!(nack.media_ssrc, SSRC);
        assert_eq!(nack.nacks.len(), 1);
        assert_eq!(nack.nacks[0].packet_id, 1050);
        assert_eq!(nack.nacks[0].lost_packets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_loss_coalesces_into_one_bitmap() {
        let (transport, mut handle) = MemoryTransport::pair();
        let _peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        for i in 0..=49u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }
        // 1050..=1055 lost in one burst.
        for i in 56..=75u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }

        let batch = handle.feedback.recv().await.unwrap();
        let nack = batch[0]
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .unwrap();
        assert_eq!(nack.nacks.len(), 1);
        assert_eq!(nack.nacks[0].packet_id, 1050);
        assert_eq!(nack.nacks[0].lost_packets, 0b1_1111);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_wrap_forwards_cleanly() {
        let (transport, mut handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        let seqs: Vec<u16> = (65_530..=65_535).chain(0..=5).collect();
        for (i, seq) in seqs.iter().enumerate() {
            feed.send(opus_packet(*seq, 20_000 + i as u32 * AUDIO_FRAME_TICKS))
                .unwrap();
        }
        for seq in &seqs {
            let forwarded = handle.forwarded.recv().await.unwrap();
            assert_eq!(forwarded.header.sequence_number, *seq);
        }
        assert_eq!(peer.media_sequence(), 5);
        assert!(handle.feedback.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn services_subscriber_nacks_from_the_ring() {
        let (transport, mut handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        for i in 0..=60u16 {
            feed.send(opus_packet(1000 + i, ts(i))).unwrap();
        }
        for _ in 0..=60u16 {
            handle.forwarded.recv().await.unwrap();
        }

        let (sender, mut sender_handle) = MemoryRtpSender::pair();
        let bob = UserId::new("bob");
        let subscription = Subscription::new(ConnectionId::generate(), sender);
        peer.attach_subscriber(bob.clone(), subscription.clone()).await;
        tokio::spawn({
            let peer = Arc::clone(&peer);
            async move {
                let _ = peer.loop_rtcp(&bob, &subscription).await;
            }
        });

        // Two pairs in one report: one aimed at a never-buffered slot, one
        // covering 1050 plus bitmap bits for 1051 and 1053.
        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: SSRC,
            nacks: vec![
                NackPair {
                    packet_id: 900,
                    lost_packets: 0,
                },
                NackPair {
                    packet_id: 1050,
                    lost_packets: 0b101,
                },
            ],
        };
        let report: RtcpBatch = vec![Box::new(nack)];
        sender_handle.rtcp_tx.send(report).unwrap();

        for expected in [1050u16, 1051, 1053] {
            let (header, payload) = sender_handle.sent.recv().await.unwrap();
            assert_eq!(header.sequence_number, expected);
            assert_eq!(payload.as_ref(), &[0xF8, 0xFF, 0xFE]);
        }
        assert!(sender_handle.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_closes_a_peer_with_no_media() {
        let (transport, handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        handle.closed().await;
        assert!(peer.connection_id().await.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn non_opus_tracks_are_dropped() {
        let (transport, handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        let _feed = handle.publish_track(96, SSRC);
        // The track never counts as media, so the watchdog still fires.
        handle.closed().await;
        assert!(peer.connection_id().await.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_inbound_stream_times_out() {
        let (transport, mut handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        let feed = handle.publish_opus_track(SSRC);
        feed.send(opus_packet(1, 10_000)).unwrap();
        handle.forwarded.recv().await.unwrap();

        // Feed stays open but quiet; the forwarder's liveness check trips.
        handle.closed().await;
        assert!(peer.connection_id().await.is_closed());
        drop(feed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (transport, handle) = MemoryTransport::pair();
        let peer = build_peer(transport);

        peer.close().await.unwrap();
        let first = peer.connection_id().await;
        peer.close().await.unwrap();
        let second = peer.connection_id().await;

        assert!(first.is_closed());
        assert_eq!(first, second);
        assert!(handle.is_closed());
    }
}
