//! Scriptable media-layer stubs for tests.
//!
//! The control plane is only exercisable against a media layer, so this
//! module provides a [`ScriptedSubsession`] whose answers are configured up
//! front and whose stream operations are recorded for later assertions.
//! Used by this crate's unit tests, the integration tests, and available to
//! downstream crates testing against the server.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::liveness::LivenessHandle;
use crate::media::{
    RtpSyncInfo, StreamParameterRequest, StreamParameters, StreamToken, Subsession,
};

/// A stream operation observed by a [`ScriptedSubsession`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start(u32, StreamToken),
    Pause(u32, StreamToken),
    Seek(u32, StreamToken, f64),
    SetScale(u32, StreamToken, f32),
    Delete(u32, StreamToken),
}

/// A [`Subsession`] whose behavior is scripted at construction time.
pub struct ScriptedSubsession {
    track_id: String,
    duration: f64,
    sdp: Option<String>,
    max_scale: f32,
    multicast_group: Option<IpAddr>,
    server_rtp_port: u16,
    server_rtcp_port: u16,
    sync: RtpSyncInfo,
    fail_setup: bool,
    next_token: AtomicU32,
    events: Mutex<Vec<StreamEvent>>,
}

impl ScriptedSubsession {
    pub fn new(track_id: &str) -> Self {
        ScriptedSubsession {
            track_id: track_id.to_string(),
            duration: 0.0,
            sdp: Some(format!(
                "m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:{track_id}\r\n"
            )),
            max_scale: 1.0,
            multicast_group: None,
            server_rtp_port: 6970,
            server_rtcp_port: 6971,
            sync: RtpSyncInfo {
                sequence_number: 1,
                timestamp: 0,
            },
            fail_setup: false,
            next_token: AtomicU32::new(1),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Accept playback scales up to `max_scale`; larger requests are
    /// clamped down to it.
    pub fn with_max_scale(mut self, max_scale: f32) -> Self {
        self.max_scale = max_scale;
        self
    }

    pub fn with_sdp(mut self, fragment: &str) -> Self {
        self.sdp = Some(fragment.to_string());
        self
    }

    /// Report no SDP, as a source that cannot be described would.
    pub fn without_sdp(mut self) -> Self {
        self.sdp = None;
        self
    }

    /// Deliver to a multicast group instead of the requesting client.
    pub fn with_multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.multicast_group = Some(IpAddr::V4(group));
        self
    }

    pub fn with_server_ports(mut self, rtp: u16, rtcp: u16) -> Self {
        self.server_rtp_port = rtp;
        self.server_rtcp_port = rtcp;
        self
    }

    pub fn with_sync(mut self, sequence_number: u16, timestamp: u32) -> Self {
        self.sync = RtpSyncInfo {
            sequence_number,
            timestamp,
        };
        self
    }

    /// Refuse to mint a stream token, as a media layer that failed to set
    /// up delivery would.
    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    /// Every stream operation observed so far, in order.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }
}

impl Subsession for ScriptedSubsession {
    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn sdp_description(&self) -> Option<String> {
        self.sdp.clone()
    }

    fn test_scale_factor(&self, scale: &mut f32) {
        if *scale > self.max_scale {
            *scale = self.max_scale;
        }
    }

    fn stream_parameters(&self, request: StreamParameterRequest<'_>) -> StreamParameters {
        let destination = self
            .multicast_group
            .or(request.destination)
            .unwrap_or(request.client_addr);

        StreamParameters {
            destination,
            ttl: request.ttl,
            is_multicast: self.multicast_group.is_some(),
            server_rtp_port: self.server_rtp_port,
            server_rtcp_port: self.server_rtcp_port,
            token: (!self.fail_setup)
                .then(|| StreamToken::new(self.next_token.fetch_add(1, Ordering::SeqCst), 1)),
        }
    }

    fn start_stream(
        &self,
        session_id: u32,
        token: StreamToken,
        liveness: LivenessHandle,
    ) -> RtpSyncInfo {
        liveness.note_liveness();
        self.events.lock().push(StreamEvent::Start(session_id, token));
        self.sync
    }

    fn pause_stream(&self, session_id: u32, token: StreamToken) {
        self.events.lock().push(StreamEvent::Pause(session_id, token));
    }

    fn seek_stream(&self, session_id: u32, token: StreamToken, npt: f64) {
        self.events.lock().push(StreamEvent::Seek(session_id, token, npt));
    }

    fn set_stream_scale(&self, session_id: u32, token: StreamToken, scale: f32) {
        self.events
            .lock()
            .push(StreamEvent::SetScale(session_id, token, scale));
    }

    fn delete_stream(&self, session_id: u32, token: StreamToken) {
        self.events.lock().push(StreamEvent::Delete(session_id, token));
    }
}
