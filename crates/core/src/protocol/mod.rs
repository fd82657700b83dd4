//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: framing
//! and parsing requests, scanning headers, routing methods, building
//! responses, and assembling SDP for DESCRIBE.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! SETUP rtsp://server/cam/track1 RTSP/1.0\r\n
//! CSeq: 3\r\n
//! Transport: RTP/AVP;unicast;client_port=5000-5001\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Transport negotiation rides in the `Transport` header (§12.39).
//! - The server pushes media out of band; the TCP connection only carries
//!   control (unless the client negotiates interleaving).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Bind a track, negotiate transport |
//! | PLAY | §10.5 | Start/resume delivery, seek, rescale |
//! | PAUSE | §10.6 | Suspend delivery |
//! | TEARDOWN | §10.7 | Destroy the session |
//! | GET_PARAMETER | §10.8 | Keep-alive |
//! | SET_PARAMETER | §10.9 | Answered 405 (unimplemented) |

pub mod headers;
pub mod request;
pub mod response;
pub mod sdp;

pub(crate) mod handler;

pub use request::{Request, RequestBuffer};
pub use response::Response;
