//! Network transport for RTSP signaling.
//!
//! One TCP connection per client carries the request/response exchange,
//! with a thread per connection ([`tcp`]). Media delivery has no transport
//! here: RTP sockets (and interleaving onto the control connection) belong
//! to the media layer behind the
//! [`Subsession`](crate::media::Subsession) contract.

pub mod tcp;
