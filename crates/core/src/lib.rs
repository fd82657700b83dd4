//! # rtsp-control — RTSP 1.0 control-plane server
//!
//! A server-side implementation of the RTSP signaling plane: it accepts
//! client TCP connections, parses the line-oriented request protocol,
//! drives a per-connection session state machine (SETUP → PLAY/PAUSE →
//! TEARDOWN) with transport negotiation and HTTP-Digest authentication,
//! and commands an external media layer through the narrow
//! [`Subsession`] contract. RTP packetization and delivery are explicitly
//! someone else's job.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request parsing, session lifecycle, transport negotiation |
//! | [RFC 2617](https://tools.ietf.org/html/rfc2617) | HTTP Digest | DESCRIBE authentication with per-connection nonces |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session-level description assembly for DESCRIBE |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Server        — listener, accept loop,   │
//! │                  admin API                │
//! │  StreamRegistry— named streams, refcounts │
//! ├───────────────────────────────────────────┤
//! │  Protocol      — framing, parsing, the    │
//! │                  command state machine    │
//! │  Auth          — digest challenge/verify  │
//! │  Liveness      — reclamation deadlines    │
//! ├───────────────────────────────────────────┤
//! │  Media contract— Subsession trait,        │
//! │                  stream tokens            │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtsp_control::{MediaSession, Server, ServerConfig};
//!
//! let mut server = Server::with_config(ServerConfig {
//!     port: 8554,
//!     ..ServerConfig::default()
//! });
//!
//! let mut session = MediaSession::new("cam", "Back Yard");
//! // session.add_subsession(Arc::new(my_media_layer_track));
//! server.add_session(Arc::new(session));
//!
//! server.start().unwrap();
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — [`Server`] root, [`ServerConfig`], listener setup.
//! - [`registry`] — [`StreamRegistry`], reference-counted stream lookup.
//! - [`protocol`] — request framing/parsing, header scanners, the command
//!   handler, response building, SDP assembly.
//! - [`auth`] — [`AuthDatabase`] and RFC 2617 digest computation.
//! - [`media`] — the [`Subsession`] contract, [`MediaSession`],
//!   [`StreamToken`].
//! - [`liveness`] — connection reclamation deadlines.
//! - [`transport`] — the TCP accept and per-connection loops.
//! - [`testing`] — scriptable media-layer stubs for tests.
//! - [`error`] — [`RtspError`] and [`Result`] alias.

pub mod auth;
pub mod error;
pub mod liveness;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod testing;
pub mod transport;

pub use auth::AuthDatabase;
pub use error::{Result, RtspError};
pub use liveness::{LivenessHandle, LivenessMonitor};
pub use media::{
    MediaSession, RtpSyncInfo, StreamParameterRequest, StreamParameters, StreamToken, Subsession,
};
pub use registry::StreamRegistry;
pub use server::{AccessCheck, Server, ServerConfig};
