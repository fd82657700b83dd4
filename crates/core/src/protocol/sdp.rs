//! SDP (Session Description Protocol, RFC 4566) assembly for DESCRIBE.
//!
//! The media layer owns the media-level sections (`m=` onward, one per
//! track); this module wraps them in the session-level preamble:
//!
//! ```text
//! v=0                                  ← protocol version
//! o=- <sess-id> 1 IN IP4 <addr>        ← origin
//! s=<session info>                     ← session name
//! c=IN IP4 <addr>                      ← connection address
//! t=0 0                                ← timing (unbounded)
//! a=tool:rtsp-control
//! a=range:npt=0-30.000                 ← aggregate duration
//! a=control:*                          ← aggregate control URL
//! m=...                                ← per-track fragments follow
//! ```

use crate::media::MediaSession;

/// Assemble the full session description served by DESCRIBE.
///
/// Returns `None` when any track cannot be described; the caller turns
/// that into a 404, matching a source file that is missing or unreadable.
pub fn session_description(session: &MediaSession, origin_addr: &str) -> Option<String> {
    let mut media_sections = Vec::with_capacity(session.subsessions().len());
    for subsession in session.subsessions() {
        match subsession.sdp_description() {
            Some(fragment) => media_sections.push(fragment),
            None => {
                tracing::warn!(
                    stream = %session.stream_name(),
                    track = subsession.track_id(),
                    "track has no SDP description"
                );
                return None;
            }
        }
    }

    let duration = session.duration();
    let range = if duration == 0.0 {
        "a=range:npt=0-".to_string()
    } else {
        format!("a=range:npt=0-{:.3}", duration.abs())
    };

    let mut sdp: Vec<String> = Vec::new();
    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o=- {} 1 IN IP4 {}",
        chrono::Utc::now().timestamp(),
        origin_addr
    ));
    sdp.push(format!("s={}", session.info()));
    sdp.push(format!("c=IN IP4 {}", origin_addr));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-control".to_string());
    sdp.push(range);
    sdp.push("a=control:*".to_string());

    let mut description = format!("{}\r\n", sdp.join("\r\n"));
    for section in media_sections {
        description.push_str(&section);
    }

    tracing::trace!(stream = %session.stream_name(), "SDP assembled");
    Some(description)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::ScriptedSubsession;

    fn two_track_session() -> MediaSession {
        let mut session = MediaSession::new("cam", "Back Yard");
        session.add_subsession(Arc::new(ScriptedSubsession::new("track1").with_duration(30.0)));
        session.add_subsession(Arc::new(
            ScriptedSubsession::new("track2")
                .with_duration(30.0)
                .with_sdp("m=audio 0 RTP/AVP 97\r\na=control:track2\r\n"),
        ));
        session
    }

    #[test]
    fn composes_session_and_media_levels() {
        let sdp = session_description(&two_track_session(), "192.168.1.10").unwrap();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("s=Back Yard\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.10\r\n"));
        assert!(sdp.contains("a=range:npt=0-30.000\r\n"));
        assert!(sdp.contains("a=control:*\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 97\r\n"));

        // Session-level lines must precede the first media section.
        let control_idx = sdp.find("a=control:*").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(control_idx < m_idx);
    }

    #[test]
    fn live_session_has_open_range() {
        let mut session = MediaSession::new("live", "Live");
        session.add_subsession(Arc::new(ScriptedSubsession::new("track1")));
        let sdp = session_description(&session, "10.0.0.1").unwrap();
        assert!(sdp.contains("a=range:npt=0-\r\n"));
    }

    #[test]
    fn mixed_durations_use_magnitude() {
        let mut session = MediaSession::new("cam", "Cam");
        session.add_subsession(Arc::new(ScriptedSubsession::new("track1").with_duration(10.0)));
        session.add_subsession(Arc::new(ScriptedSubsession::new("track2").with_duration(45.5)));
        let sdp = session_description(&session, "10.0.0.1").unwrap();
        assert!(sdp.contains("a=range:npt=0-45.500\r\n"));
    }

    #[test]
    fn missing_track_description_fails() {
        let mut session = MediaSession::new("cam", "Cam");
        session.add_subsession(Arc::new(ScriptedSubsession::new("track1")));
        session.add_subsession(Arc::new(ScriptedSubsession::new("track2").without_sdp()));
        assert!(session_description(&session, "10.0.0.1").is_none());
    }
}
