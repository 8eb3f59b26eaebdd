//! Media-clock constants and pipeline tuning.
//!
//! All media time is measured in 48 kHz RTP ticks; wall-clock timeouts are
//! [`Duration`]s.

use std::time::Duration;

/// Opus clock rate (Hz).
pub const RTP_CLOCK_RATE: u32 = 48_000;

/// Opus frame duration in ticks at 48 kHz (20 ms).
pub const AUDIO_FRAME_TICKS: u32 = RTP_CLOCK_RATE / 50;

/// Age (in ticks, ~500 ms) past which a buffered or inbound packet is no
/// longer worth forwarding or retransmitting.
pub const PACKET_EXPIRATION: u32 = RTP_CLOCK_RATE / 2;

/// Default dynamic RTP payload type for Opus. Inbound tracks carrying any
/// other payload type are dropped at the track-arrival boundary.
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Time allowed between peer construction and the first inbound track.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the forwarder will sit with no ingress packet and no retransmission
/// request before declaring the inbound stream dead.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// NACK originator wake-up period (~a quarter of the expiration window).
pub const NACK_TICK: Duration = Duration::from_millis(125);

/// Ingress queue depth — over 16 minutes of 20 ms Opus frames, so a full
/// queue means a stalled forwarder, not burst traffic.
pub const QUEUE_CAPACITY: usize = 48_000;

/// Pending-loss queue depth: one NACK window (base + 16 bitmap bits).
/// Gap detection silently drops anything beyond it.
pub const LOST_CAPACITY: usize = 17;

/// Inbound retransmission-request queue depth; overflow drops the request.
pub const NACK_CAPACITY: usize = 48_000;
