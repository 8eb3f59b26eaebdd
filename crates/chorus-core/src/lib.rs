//! chorus-core — per-participant forwarding core for an Opus audio SFU.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: identifiers, clock constants, the replay ring, and the
//!   loss/NACK arithmetic (no I/O).
//! - **application**: port traits + the [`application::peer::Peer`] state
//!   machine and its cooperating activities (watchdog, ingress reader,
//!   forwarder, NACK originator, per-sender RTCP loops).
//! - **adapters**: in-memory, channel-backed implementations of the ports,
//!   used by the tests and as a reference for real transports.
//!
//! Signalling, ICE/DTLS/SRTP establishment, and room membership live in the
//! embedding application; the core consumes them through the port traits.

pub mod adapters;
pub mod application;
pub mod domain;
