//! The contract between the control plane and the media layer.
//!
//! The server never touches RTP packets, sockets for media delivery, or
//! codecs. It drives an external media layer through the [`Subsession`]
//! trait (one implementor per track) and identifies in-flight deliveries
//! with opaque [`StreamToken`]s minted by that layer. A [`MediaSession`]
//! groups the tracks of one named stream and carries the bookkeeping the
//! registry needs (reference count, deferred-destruction latch).

use std::net::{IpAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::liveness::LivenessHandle;

/// Opaque handle for one (session, track) delivery, minted by the media
/// layer in [`Subsession::stream_parameters`] and passed back verbatim in
/// every subsequent stream operation.
///
/// The generation counter lets the media layer detect stale handles when an
/// id is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken {
    id: u32,
    generation: u32,
}

impl StreamToken {
    pub fn new(id: u32, generation: u32) -> Self {
        StreamToken { id, generation }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// RTP synchronization info reported when delivery starts, echoed to the
/// client in the `RTP-Info` response header (RFC 2326 §12.33).
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpSyncInfo {
    pub sequence_number: u16,
    pub timestamp: u32,
}

/// Everything the media layer needs to set up delivery for one track,
/// gathered from the SETUP request and the connection.
pub struct StreamParameterRequest<'a> {
    pub session_id: u32,
    /// Address of the requesting client.
    pub client_addr: IpAddr,
    pub client_rtp_port: u16,
    pub client_rtcp_port: u16,
    /// The RTSP control connection, present when the client chose
    /// RTP-over-TCP interleaving; the media layer clones it for writing.
    pub tcp_stream: Option<&'a TcpStream>,
    pub rtp_channel_id: u8,
    pub rtcp_channel_id: u8,
    /// Client-requested destination override, already filtered by the
    /// server's `allow_client_destination` policy.
    pub destination: Option<IpAddr>,
    pub ttl: u8,
}

/// The media layer's answer to [`Subsession::stream_parameters`].
#[derive(Debug, Clone)]
pub struct StreamParameters {
    /// Where media will be sent: the client address for unicast, the group
    /// address for multicast.
    pub destination: IpAddr,
    pub ttl: u8,
    pub is_multicast: bool,
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
    /// `None` when the media layer could not set up delivery; the SETUP
    /// still succeeds at the protocol level and later stream operations
    /// degrade to no-ops for this track.
    pub token: Option<StreamToken>,
}

/// One media track, implemented by the external media layer.
///
/// All methods take `&self`: a subsession is shared between every client
/// connection streaming it, so implementors use interior mutability for
/// per-delivery state keyed by the token.
pub trait Subsession: Send + Sync {
    /// Stable track identifier, unique within the parent session
    /// (e.g. `track1`).
    fn track_id(&self) -> &str;

    /// Track duration in seconds; 0.0 for live sources.
    fn duration(&self) -> f64;

    /// The media-level SDP fragment for this track (`m=` line onward), or
    /// `None` when the source cannot be described (missing file, bad
    /// format).
    fn sdp_description(&self) -> Option<String>;

    /// Clamp or adjust a requested playback scale to something this track
    /// can deliver. The default accepts only normal speed.
    fn test_scale_factor(&self, scale: &mut f32) {
        *scale = 1.0;
    }

    /// Negotiate delivery for one client: pick server ports and the
    /// destination, and mint a token for the delivery.
    fn stream_parameters(&self, request: StreamParameterRequest<'_>) -> StreamParameters;

    /// Start (or resume) delivery. The `liveness` handle must be invoked by
    /// the media layer whenever the client demonstrates liveness on the
    /// media path, e.g. on inbound RTCP.
    fn start_stream(
        &self,
        session_id: u32,
        token: StreamToken,
        liveness: LivenessHandle,
    ) -> RtpSyncInfo;

    /// Suspend delivery; a later [`start_stream`](Self::start_stream)
    /// resumes it.
    fn pause_stream(&self, session_id: u32, token: StreamToken);

    /// Reposition delivery to `npt` seconds on the normal-play-time axis.
    fn seek_stream(&self, session_id: u32, token: StreamToken, npt: f64);

    /// Apply a playback scale previously vetted by
    /// [`test_scale_factor`](Self::test_scale_factor).
    fn set_stream_scale(&self, session_id: u32, token: StreamToken, scale: f32);

    /// Tear down the delivery and invalidate the token.
    fn delete_stream(&self, session_id: u32, token: StreamToken);
}

/// Per-track state held by a connection for its bound media session.
pub(crate) struct StreamState {
    pub subsession: Arc<dyn Subsession>,
    pub token: Option<StreamToken>,
}

/// A named stream offered by the server: an ordered set of tracks plus the
/// registry bookkeeping.
///
/// The reference count equals the number of connections currently bound to
/// this session via SETUP. When an administrator removes a session that is
/// still referenced, the delete-when-unreferenced latch is set instead and
/// the registry drops the entry once the last binding is released.
pub struct MediaSession {
    name: String,
    info: String,
    subsessions: Vec<Arc<dyn Subsession>>,
    reference_count: AtomicU32,
    delete_when_unreferenced: AtomicBool,
}

impl MediaSession {
    /// Create a session named `name` (the URL path component clients use)
    /// with a human-readable `info` string for the SDP `s=` line.
    pub fn new(name: &str, info: &str) -> Self {
        MediaSession {
            name: name.to_string(),
            info: info.to_string(),
            subsessions: Vec::new(),
            reference_count: AtomicU32::new(0),
            delete_when_unreferenced: AtomicBool::new(false),
        }
    }

    /// Append a track. Order matters: it defines track indices for the
    /// per-connection stream state array.
    pub fn add_subsession(&mut self, subsession: Arc<dyn Subsession>) {
        self.subsessions.push(subsession);
    }

    pub fn stream_name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn subsessions(&self) -> &[Arc<dyn Subsession>] {
        &self.subsessions
    }

    /// Aggregate duration in seconds.
    ///
    /// When every track reports the same duration, that value is returned.
    /// When they differ, the magnitude of the longest is returned negated:
    /// a signal to PLAY handling that the aggregate mixes durations and the
    /// absolute value is the one to clamp against.
    pub fn duration(&self) -> f64 {
        let mut durations = self.subsessions.iter().map(|s| s.duration());
        let Some(first) = durations.next() else {
            return 0.0;
        };

        let (mut min, mut max) = (first, first);
        for d in durations {
            min = min.min(d);
            max = max.max(d);
        }

        if min == max {
            max
        } else {
            -max
        }
    }

    /// Probe an aggregate playback scale across every track.
    ///
    /// Each track may adjust the requested factor; if they all settle on
    /// the same adjusted value it is kept, otherwise the aggregate falls
    /// back to normal speed.
    pub fn test_scale_factor(&self, scale: &mut f32) {
        let mut agreed: Option<f32> = None;
        for subsession in &self.subsessions {
            let mut adjusted = *scale;
            subsession.test_scale_factor(&mut adjusted);
            match agreed {
                None => agreed = Some(adjusted),
                Some(a) if a == adjusted => {}
                Some(_) => {
                    *scale = 1.0;
                    return;
                }
            }
        }
        *scale = agreed.unwrap_or(1.0);
    }

    /// Number of connections currently bound to this session.
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::SeqCst)
    }

    pub(crate) fn retain(&self) {
        self.reference_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the reference count, returning the new value.
    pub(crate) fn release(&self) -> u32 {
        self.reference_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn mark_delete_when_unreferenced(&self) {
        self.delete_when_unreferenced.store(true, Ordering::SeqCst);
    }

    pub(crate) fn delete_when_unreferenced(&self) -> bool {
        self.delete_when_unreferenced.load(Ordering::SeqCst)
    }
}
