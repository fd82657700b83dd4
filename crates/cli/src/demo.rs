//! A loopback media layer so the server can be driven by a real RTSP
//! client without any actual media pipeline behind it.

use std::sync::atomic::{AtomicU32, Ordering};

use rtsp_control::{
    LivenessHandle, RtpSyncInfo, StreamParameterRequest, StreamParameters, StreamToken, Subsession,
};

/// A placeholder H.264 track: answers every control-plane operation and
/// logs it, but never sends a packet.
pub struct DemoSubsession {
    next_token: AtomicU32,
}

impl DemoSubsession {
    pub fn new() -> Self {
        DemoSubsession {
            next_token: AtomicU32::new(1),
        }
    }
}

impl Subsession for DemoSubsession {
    fn track_id(&self) -> &str {
        "track1"
    }

    fn duration(&self) -> f64 {
        0.0 // live
    }

    fn sdp_description(&self) -> Option<String> {
        Some(
            "m=video 0 RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=fmtp:96 packetization-mode=1\r\n\
             a=control:track1\r\n"
                .to_string(),
        )
    }

    fn stream_parameters(&self, request: StreamParameterRequest<'_>) -> StreamParameters {
        let token = StreamToken::new(self.next_token.fetch_add(1, Ordering::SeqCst), 1);
        tracing::info!(
            session_id = request.session_id,
            client = %request.client_addr,
            rtp_port = request.client_rtp_port,
            interleaved = request.tcp_stream.is_some(),
            "delivery negotiated"
        );
        StreamParameters {
            destination: request.destination.unwrap_or(request.client_addr),
            ttl: request.ttl,
            is_multicast: false,
            server_rtp_port: 6970,
            server_rtcp_port: 6971,
            token: Some(token),
        }
    }

    fn start_stream(
        &self,
        session_id: u32,
        token: StreamToken,
        _liveness: LivenessHandle,
    ) -> RtpSyncInfo {
        tracing::info!(session_id, token_id = token.id(), "start (demo: no packets sent)");
        RtpSyncInfo {
            sequence_number: 1,
            timestamp: 0,
        }
    }

    fn pause_stream(&self, session_id: u32, token: StreamToken) {
        tracing::info!(session_id, token_id = token.id(), "pause");
    }

    fn seek_stream(&self, session_id: u32, token: StreamToken, npt: f64) {
        tracing::info!(session_id, token_id = token.id(), npt, "seek");
    }

    fn set_stream_scale(&self, session_id: u32, token: StreamToken, scale: f32) {
        tracing::info!(session_id, token_id = token.id(), scale, "set scale");
    }

    fn delete_stream(&self, session_id: u32, token: StreamToken) {
        tracing::info!(session_id, token_id = token.id(), "delete");
    }
}
