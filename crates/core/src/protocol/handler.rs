//! Per-connection RTSP command handling.
//!
//! A [`MethodHandler`] owns everything one client connection knows: the
//! media session it is bound to (at most one), the per-track stream tokens,
//! the interleaved-channel counter, the digest-auth context and the
//! session-active flag. Each parsed request is dispatched here exactly once
//! and turned into a [`Response`]; protocol errors never escape as `Err`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;

use crate::auth::{self, DigestContext};
use crate::liveness::LivenessHandle;
use crate::media::{MediaSession, StreamParameterRequest, StreamState, Subsession};
use crate::protocol::headers::{self, StreamingMode, UNASSIGNED_CHANNEL_ID};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ALLOWED_METHODS};
use crate::protocol::sdp;
use crate::server::{rtsp_url_prefix, ServerContext};

/// Handles RTSP method requests for a single TCP connection.
pub(crate) struct MethodHandler {
    ctx: Arc<ServerContext>,
    /// Clone of the connection's socket, used for getsockname (URL prefix,
    /// Transport `source=`) and handed to the media layer for interleaving.
    stream: TcpStream,
    peer_addr: SocketAddr,
    session_id: u32,
    liveness: LivenessHandle,
    /// The media session bound by SETUP; a connection never holds two.
    bound: Option<Arc<MediaSession>>,
    /// One entry per track of the bound session, in subsession order.
    stream_states: Vec<StreamState>,
    /// Next interleaved channel id pair; advances by 2 on every SETUP.
    tcp_channel_counter: u8,
    /// Set by a SETUP carrying `x-playNow:` or a `Range:` header; the
    /// connection synthesizes a PLAY right after the SETUP response.
    stream_after_setup: bool,
    /// Cleared by TEARDOWN, 404 and 461; the connection is destroyed after
    /// the current response is sent.
    session_active: bool,
    auth: DigestContext,
}

impl MethodHandler {
    pub fn new(
        ctx: Arc<ServerContext>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        session_id: u32,
        liveness: LivenessHandle,
    ) -> Self {
        MethodHandler {
            ctx,
            stream,
            peer_addr,
            session_id,
            liveness,
            bound: None,
            stream_states: Vec::new(),
            tcp_channel_counter: 0,
            stream_after_setup: false,
            session_active: true,
            auth: DigestContext::new(),
        }
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    pub fn stream_after_setup(&self) -> bool {
        self.stream_after_setup
    }

    /// Dispatch one parsed request. `raw` is the full request text, scanned
    /// on demand for the headers each command cares about.
    pub fn handle(&mut self, req: &Request, raw: &str) -> Response {
        match req.method.as_str() {
            "OPTIONS" => self.handle_options(&req.cseq),
            "DESCRIBE" => self.handle_describe(req, raw),
            "SETUP" => self.handle_setup(req, raw),
            "TEARDOWN" | "PLAY" | "PAUSE" | "GET_PARAMETER" | "SET_PARAMETER" => {
                self.handle_within_session(req, raw)
            }
            _ => {
                tracing::warn!(method = %req.method, "unsupported RTSP method");
                self.method_not_allowed(&req.cseq)
            }
        }
    }

    /// 400 for an unparseable request. The CSeq may be garbage, so it is
    /// deliberately not echoed.
    pub fn bad_request(&self) -> Response {
        Response::bad_request()
            .with_date()
            .add_header("Allow", ALLOWED_METHODS)
    }

    /// Release everything this connection holds: stream tokens first, then
    /// the media-session binding. Called when the connection is destroyed.
    pub fn release(&mut self) {
        self.reclaim_stream_states();
        if let Some(session) = self.bound.take() {
            self.ctx.registry.release_binding(&session);
        }
    }

    fn handle_options(&self, cseq: &str) -> Response {
        tracing::debug!(session_id = self.session_id, %cseq, "OPTIONS");
        Response::ok()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header("Public", ALLOWED_METHODS)
    }

    fn handle_describe(&mut self, req: &Request, raw: &str) -> Response {
        tracing::debug!(session_id = self.session_id, stream = %req.url_suffix, "DESCRIBE");

        if let Err(challenge) = self.authenticate("DESCRIBE", &req.cseq, &req.url_suffix, raw) {
            return challenge;
        }

        let Some(session) = self.ctx.registry.lookup(&req.url_suffix) else {
            tracing::warn!(stream = %req.url_suffix, "DESCRIBE for unknown stream");
            return self.not_found(&req.cseq);
        };

        let local_ip = self.local_ip();
        let Some(description) = sdp::session_description(&session, &local_ip.to_string()) else {
            return Response::description_unavailable()
                .add_header("CSeq", &req.cseq)
                .with_date();
        };

        // Content-Base ensures the client issues SETUP against the URL we
        // expect, whatever shape its DESCRIBE URL had.
        let rtsp_url = format!(
            "{}{}",
            rtsp_url_prefix(local_ip, self.ctx.server_port),
            session.stream_name()
        );

        Response::ok()
            .add_header("CSeq", &req.cseq)
            .with_date()
            .add_header("Content-Base", &format!("{rtsp_url}/"))
            .add_header("Content-Type", "application/sdp")
            .with_body(description)
    }

    fn handle_setup(&mut self, req: &Request, raw: &str) -> Response {
        self.stream_after_setup = false;

        // urlPreSuffix names the stream, urlSuffix the track.
        let mut stream_name = req.url_pre_suffix.as_str();
        let mut track_id = req.url_suffix.as_str();

        // A connection holds at most one binding. A SETUP for a different
        // stream drops the current one: tokens are reclaimed and the old
        // session's reference released before the new bind.
        if let Some(bound) = self.bound.take() {
            if bound.stream_name() == stream_name {
                self.bound = Some(bound);
            } else {
                tracing::debug!(
                    session_id = self.session_id,
                    old = %bound.stream_name(),
                    new = %stream_name,
                    "SETUP rebinds to a different stream"
                );
                self.reclaim_stream_states();
                self.ctx.registry.release_binding(&bound);
            }
        }

        let session = match self.bound.clone() {
            Some(session) => session,
            None => {
                if stream_name.is_empty() && self.ctx.registry.lookup("").is_none() {
                    // The URL carried no track component; what parsed as the
                    // suffix is really the stream name.
                    stream_name = track_id;
                    track_id = "";
                }
                let Some(session) = self.ctx.registry.bind(stream_name) else {
                    tracing::warn!(stream = %stream_name, "SETUP for unknown stream");
                    return self.not_found(&req.cseq);
                };
                self.reclaim_stream_states();
                self.stream_states = session
                    .subsessions()
                    .iter()
                    .map(|subsession| StreamState {
                        subsession: subsession.clone(),
                        token: None,
                    })
                    .collect();
                self.bound = Some(session.clone());
                session
            }
        };

        let stream_num = if !track_id.is_empty() {
            match self
                .stream_states
                .iter()
                .position(|state| state.subsession.track_id() == track_id)
            {
                Some(i) => i,
                None => {
                    tracing::warn!(stream = %session.stream_name(), track = %track_id,
                        "SETUP for unknown track");
                    return self.not_found(&req.cseq);
                }
            }
        } else if self.stream_states.len() == 1 {
            // A trackless SETUP is only unambiguous for single-track streams.
            0
        } else {
            return self.bad_request();
        };

        let mut transport = headers::parse_transport(raw);
        if transport.mode == StreamingMode::RtpTcp
            && transport.rtp_channel_id == UNASSIGNED_CHANNEL_ID
        {
            // TCP without `interleaved=`: assign channel ids ourselves.
            transport.rtp_channel_id = self.tcp_channel_counter;
            transport.rtcp_channel_id = self.tcp_channel_counter.wrapping_add(1);
        }
        self.tcp_channel_counter = self.tcp_channel_counter.wrapping_add(2);

        // A Range header on SETUP is not legal, but some clients use it (or
        // x-playNow:) to fold SETUP and PLAY into one round trip.
        self.stream_after_setup =
            headers::parse_range(raw).is_some() || headers::has_play_now(raw);

        let (destination, ttl) = if self.ctx.allow_client_destination {
            (transport.destination, transport.ttl)
        } else {
            (None, 255)
        };

        let subsession = self.stream_states[stream_num].subsession.clone();
        let params = subsession.stream_parameters(StreamParameterRequest {
            session_id: self.session_id,
            client_addr: self.peer_addr.ip(),
            client_rtp_port: transport.client_rtp_port,
            client_rtcp_port: transport.client_rtcp_port,
            tcp_stream: (transport.mode == StreamingMode::RtpTcp).then_some(&self.stream),
            rtp_channel_id: transport.rtp_channel_id,
            rtcp_channel_id: transport.rtcp_channel_id,
            destination,
            ttl,
        });
        self.stream_states[stream_num].token = params.token;

        tracing::info!(
            session_id = self.session_id,
            stream = %session.stream_name(),
            track = subsession.track_id(),
            mode = ?transport.mode,
            multicast = params.is_multicast,
            "track set up"
        );

        let destination = params.destination;
        let source = self.local_ip();
        let transport_line = match (params.is_multicast, transport.mode) {
            (false, StreamingMode::RtpUdp) => format!(
                "RTP/AVP;unicast;destination={destination};source={source};client_port={}-{};server_port={}-{}",
                transport.client_rtp_port,
                transport.client_rtcp_port,
                params.server_rtp_port,
                params.server_rtcp_port
            ),
            (false, StreamingMode::RtpTcp) => format!(
                "RTP/AVP/TCP;unicast;destination={destination};source={source};interleaved={}-{}",
                transport.rtp_channel_id, transport.rtcp_channel_id
            ),
            (false, StreamingMode::RawUdp) => format!(
                "{};unicast;destination={destination};source={source};client_port={};server_port={}",
                transport.mode_string.as_deref().unwrap_or("RAW/RAW/UDP"),
                transport.client_rtp_port,
                params.server_rtp_port
            ),
            (true, StreamingMode::RtpUdp) => format!(
                "RTP/AVP;multicast;destination={destination};source={source};port={}-{};ttl={}",
                params.server_rtp_port, params.server_rtcp_port, params.ttl
            ),
            (true, StreamingMode::RtpTcp) => {
                // Multicast cannot ride a unicast TCP connection.
                tracing::warn!(stream = %session.stream_name(),
                    "rejecting TCP interleaving for a multicast stream");
                return self.unsupported_transport(&req.cseq);
            }
            (true, StreamingMode::RawUdp) => format!(
                "{};multicast;destination={destination};source={source};port={};ttl={}",
                transport.mode_string.as_deref().unwrap_or("RAW/RAW/UDP"),
                params.server_rtp_port,
                params.ttl
            ),
        };

        Response::ok()
            .add_header("CSeq", &req.cseq)
            .with_date()
            .add_header("Transport", &transport_line)
            .add_header("Session", &self.session_id.to_string())
    }

    /// Route TEARDOWN/PLAY/PAUSE/GET_PARAMETER/SET_PARAMETER.
    ///
    /// The operation is track-level when `urlPreSuffix` names the bound
    /// stream and `urlSuffix` a track; aggregate when either component
    /// names the stream; anything else does not match this connection's
    /// session at all.
    fn handle_within_session(&mut self, req: &Request, raw: &str) -> Response {
        let Some(session) = self.bound.clone() else {
            tracing::warn!(method = %req.method, "request without a prior SETUP");
            return self.method_not_allowed(&req.cseq);
        };

        let subsession: Option<Arc<dyn Subsession>> = if !req.url_suffix.is_empty()
            && session.stream_name() == req.url_pre_suffix
        {
            match session
                .subsessions()
                .iter()
                .find(|s| s.track_id() == req.url_suffix)
            {
                Some(subsession) => Some(subsession.clone()),
                None => {
                    tracing::warn!(track = %req.url_suffix, "request for unknown track");
                    return self.not_found(&req.cseq);
                }
            }
        } else if session.stream_name() == req.url_suffix
            || session.stream_name() == req.url_pre_suffix
        {
            None // aggregate operation across every track
        } else {
            tracing::warn!(
                pre = %req.url_pre_suffix,
                suffix = %req.url_suffix,
                bound = %session.stream_name(),
                "request does not match the bound stream"
            );
            return self.not_found(&req.cseq);
        };

        match req.method.as_str() {
            "TEARDOWN" => self.handle_teardown(&req.cseq),
            "PLAY" => self.handle_play(&session, subsession, &req.cseq, raw),
            "PAUSE" => self.handle_pause(subsession, &req.cseq),
            "GET_PARAMETER" => self.handle_get_parameter(&req.cseq),
            // SET_PARAMETER is deliberately unimplemented; GET_PARAMETER
            // already serves as the keep-alive.
            _ => self.method_not_allowed(&req.cseq),
        }
    }

    fn handle_play(
        &mut self,
        session: &Arc<MediaSession>,
        subsession: Option<Arc<dyn Subsession>>,
        cseq: &str,
        raw: &str,
    ) -> Response {
        let rtsp_url = format!(
            "{}{}",
            rtsp_url_prefix(self.local_ip(), self.ctx.server_port),
            session.stream_name()
        );

        let scale_requested = headers::parse_scale(raw);
        let mut scale = scale_requested.unwrap_or(1.0);
        match &subsession {
            Some(subsession) => subsession.test_scale_factor(&mut scale),
            None => session.test_scale_factor(&mut scale),
        }

        let range_requested = headers::parse_range(raw);
        let (mut range_start, mut range_end) = range_requested.unwrap_or((0.0, 0.0));

        // A negative aggregate duration signals mixed track durations; the
        // magnitude is the longest and is what the range clamps against.
        let mut duration = subsession
            .as_ref()
            .map_or_else(|| session.duration(), |s| s.duration());
        if duration < 0.0 {
            duration = -duration;
        }

        if range_end <= 0.0 || range_end > duration {
            range_end = duration;
        }
        if range_start < 0.0 {
            range_start = 0.0;
        } else if range_end > 0.0 && scale > 0.0 && range_start > range_end {
            range_start = range_end;
        }

        tracing::debug!(
            session_id = self.session_id,
            scale,
            range_start,
            range_end,
            aggregate = subsession.is_none(),
            "PLAY"
        );

        let mut rtp_info_items = Vec::new();
        for state in &self.stream_states {
            let affected = subsession
                .as_ref()
                .map_or(true, |s| Arc::ptr_eq(s, &state.subsession));
            if !affected {
                continue;
            }
            // A missing token means the media layer failed this track's
            // setup; it simply contributes nothing to RTP-Info.
            let Some(token) = state.token else { continue };

            if scale_requested.is_some() {
                state
                    .subsession
                    .set_stream_scale(self.session_id, token, scale);
            }
            if range_requested.is_some() {
                state
                    .subsession
                    .seek_stream(self.session_id, token, range_start);
            }
            let sync = state
                .subsession
                .start_stream(self.session_id, token, self.liveness.clone());

            rtp_info_items.push(format!(
                "url={}/{};seq={};rtptime={}",
                rtsp_url,
                state.subsession.track_id(),
                sync.sequence_number,
                sync.timestamp
            ));
        }

        let mut response = Response::ok().add_header("CSeq", cseq).with_date();
        if scale_requested.is_some() {
            response = response.add_header("Scale", &format!("{scale:.6}"));
        }
        if range_requested.is_some() {
            let value = if range_end == 0.0 && scale >= 0.0 {
                format!("npt={range_start:.3}-")
            } else {
                format!("npt={range_start:.3}-{range_end:.3}")
            };
            response = response.add_header("Range", &value);
        }
        response = response.add_header("Session", &self.session_id.to_string());
        if !rtp_info_items.is_empty() {
            response = response.add_header("RTP-Info", &rtp_info_items.join(","));
        }
        response
    }

    fn handle_pause(&mut self, subsession: Option<Arc<dyn Subsession>>, cseq: &str) -> Response {
        for state in &self.stream_states {
            let affected = subsession
                .as_ref()
                .map_or(true, |s| Arc::ptr_eq(s, &state.subsession));
            if let (true, Some(token)) = (affected, state.token) {
                state.subsession.pause_stream(self.session_id, token);
            }
        }
        tracing::debug!(session_id = self.session_id, "PAUSE");
        Response::ok()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header("Session", &self.session_id.to_string())
    }

    fn handle_teardown(&mut self, cseq: &str) -> Response {
        tracing::info!(session_id = self.session_id, "TEARDOWN");
        // Stream states and the binding are released when the connection is
        // destroyed, right after this response is sent.
        self.session_active = false;
        Response::ok()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header("Session", &self.session_id.to_string())
    }

    /// GET_PARAMETER is a keep-alive: the liveness refresh already happened
    /// when the request arrived, so an empty 200 is all that is needed.
    fn handle_get_parameter(&self, cseq: &str) -> Response {
        tracing::trace!(session_id = self.session_id, "GET_PARAMETER keep-alive");
        Response::ok()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header("Session", &self.session_id.to_string())
    }

    /// DESCRIBE access control: the host hook first, then HTTP-Digest
    /// against the configured database. `Err` carries the 401 to send.
    fn authenticate(
        &mut self,
        method: &str,
        cseq: &str,
        url_suffix: &str,
        raw: &str,
    ) -> std::result::Result<(), Response> {
        if let Some(check) = &self.ctx.access_check {
            if !check(&self.stream, self.peer_addr, url_suffix) {
                tracing::warn!(peer = %self.peer_addr, "client refused by access check");
                return Err(Response::unauthorized().add_header("CSeq", cseq).with_date());
            }
        }

        let Some(db) = self.ctx.auth_db.clone() else {
            return Ok(());
        };

        if self.digest_ok(&db, method, raw) {
            return Ok(());
        }

        self.auth.regenerate(db.realm());
        let nonce = self.auth.nonce().unwrap_or_default();
        tracing::debug!(peer = %self.peer_addr, "digest challenge issued");
        Err(Response::unauthorized()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header(
                "WWW-Authenticate",
                &format!("Digest realm=\"{}\", nonce=\"{nonce}\"", db.realm()),
            ))
    }

    fn digest_ok(&self, db: &crate::auth::AuthDatabase, method: &str, raw: &str) -> bool {
        // Nothing can verify until a challenge has handed out a nonce.
        let (Some(nonce), Some(expected_realm)) = (self.auth.nonce(), self.auth.realm()) else {
            return false;
        };
        let Some(fields) = headers::parse_authorization(raw) else {
            return false;
        };
        let (Some(username), Some(realm), Some(field_nonce), Some(uri), Some(response)) = (
            fields.username,
            fields.realm,
            fields.nonce,
            fields.uri,
            fields.response,
        ) else {
            return false;
        };
        if realm != expected_realm || field_nonce != nonce {
            return false;
        }
        let Some(secret) = db.lookup_secret(&username) else {
            tracing::warn!(username = %username, "digest attempt for unknown user");
            return false;
        };

        let expected = auth::compute_digest_response(
            &username,
            &realm,
            &secret,
            db.passwords_are_md5(),
            nonce,
            method,
            &uri,
        );
        expected == response
    }

    /// 404 for an unknown stream or track. Latches the connection inactive:
    /// there is nothing useful a client can do on it afterwards.
    fn not_found(&mut self, cseq: &str) -> Response {
        self.session_active = false;
        Response::stream_not_found()
            .add_header("CSeq", cseq)
            .with_date()
    }

    fn unsupported_transport(&mut self, cseq: &str) -> Response {
        self.session_active = false;
        Response::unsupported_transport()
            .add_header("CSeq", cseq)
            .with_date()
    }

    fn method_not_allowed(&self, cseq: &str) -> Response {
        Response::method_not_allowed()
            .add_header("CSeq", cseq)
            .with_date()
            .add_header("Allow", ALLOWED_METHODS)
    }

    fn reclaim_stream_states(&mut self) {
        let session_id = self.session_id;
        for state in self.stream_states.drain(..) {
            if let Some(token) = state.token {
                state.subsession.delete_stream(session_id, token);
            }
        }
    }

    /// Interface address of this connection, for the URL prefix and the
    /// Transport `source=` field.
    fn local_ip(&self) -> IpAddr {
        self.stream
            .local_addr()
            .map(|addr| addr.ip())
            .ok()
            .or(self.ctx.receiving_interface)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::auth::AuthDatabase;
    use crate::liveness::LivenessMonitor;
    use crate::registry::StreamRegistry;
    use crate::testing::{ScriptedSubsession, StreamEvent};

    /// A connected loopback socket pair; the server side backs the handler.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, server_side)
    }

    fn context(registry: StreamRegistry) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            registry,
            auth_db: None,
            access_check: None,
            server_port: 8554,
            receiving_interface: None,
            allow_client_destination: false,
            reclamation_timeout_secs: 0,
        })
    }

    fn handler_for(ctx: Arc<ServerContext>) -> (MethodHandler, TcpStream) {
        let (client, server_side) = socket_pair();
        let peer = server_side.peer_addr().unwrap();
        let handler = MethodHandler::new(
            ctx,
            server_side,
            peer,
            1,
            Arc::new(LivenessMonitor::new(0)),
        );
        (handler, client)
    }

    fn parse(raw: &str) -> Request {
        Request::parse(raw).unwrap()
    }

    fn single_track_registry(sub: ScriptedSubsession) -> (StreamRegistry, Arc<ScriptedSubsession>) {
        let registry = StreamRegistry::new();
        let sub = Arc::new(sub);
        let mut session = crate::media::MediaSession::new("cam", "Camera");
        session.add_subsession(sub.clone());
        registry.add(Arc::new(session));
        (registry, sub)
    }

    #[test]
    fn options_lists_every_method() {
        let (mut handler, _client) = handler_for(context(StreamRegistry::new()));
        let raw = "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"));
        assert!(resp.contains(&format!("Public: {ALLOWED_METHODS}\r\n")));
        assert!(handler.session_active());
    }

    #[test]
    fn describe_unknown_stream_is_404_and_deactivates() {
        let (mut handler, _client) = handler_for(context(StreamRegistry::new()));
        let raw = "DESCRIBE rtsp://h/nope RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 404 Stream Not Found\r\nCSeq: 2\r\n"));
        assert!(!handler.session_active());
    }

    #[test]
    fn describe_without_sdp_is_404_file_not_found() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1").without_sdp());
        let (mut handler, _client) = handler_for(context(registry));
        let raw = "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 404 File Not Found, Or In Incorrect Format\r\n"));
    }

    #[test]
    fn describe_returns_sdp_with_content_base() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        let raw = "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 2\r\n"));
        assert!(resp.contains("Content-Type: application/sdp\r\n"));
        assert!(resp.contains("Content-Base: rtsp://127.0.0.1:8554/cam/\r\n"));
        assert!(resp.contains("v=0\r\n"));
    }

    #[test]
    fn play_without_setup_is_405() {
        let (mut handler, _client) = handler_for(context(StreamRegistry::new()));
        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 3\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 405 Method Not Allowed\r\nCSeq: 3\r\n"));
        assert!(resp.contains(&format!("Allow: {ALLOWED_METHODS}\r\n")));
    }

    #[test]
    fn setup_tcp_assigns_interleaved_channels() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP/TCP;unicast\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 3\r\n"));
        assert!(resp.contains("interleaved=0-1"), "resp: {resp}");
        assert!(resp.contains("Session: 1\r\n"));

        // The second SETUP on the same connection advances the counter.
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.contains("interleaved=2-3"), "resp: {resp}");
    }

    #[test]
    fn setup_honors_requested_interleaved_channels() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP/TCP;unicast;interleaved=6-7\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.contains("interleaved=6-7"));

        // The counter still advanced, so defaulted channels come after.
        let raw2 = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 4\r\n\
                    Transport: RTP/AVP/TCP;unicast\r\n\r\n";
        let resp = handler.handle(&parse(raw2), raw2).serialize();
        assert!(resp.contains("interleaved=2-3"), "resp: {resp}");
    }

    #[test]
    fn setup_udp_reports_ports() {
        let (registry, _) = single_track_registry(
            ScriptedSubsession::new("track1").with_server_ports(6970, 6971),
        );
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(
            resp.contains("client_port=5000-5001;server_port=6970-6971"),
            "resp: {resp}"
        );
        assert!(resp.contains("destination=127.0.0.1;source=127.0.0.1;"));
    }

    #[test]
    fn setup_unknown_track_is_404() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track9 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 404 Stream Not Found\r\n"));
        assert!(!handler.session_active());
    }

    #[test]
    fn trackless_setup_on_multitrack_stream_is_400() {
        let registry = StreamRegistry::new();
        let mut session = crate::media::MediaSession::new("cam", "Camera");
        session.add_subsession(Arc::new(ScriptedSubsession::new("track1")));
        session.add_subsession(Arc::new(ScriptedSubsession::new("track2")));
        registry.add(Arc::new(session));
        let (mut handler, _client) = handler_for(context(registry));

        // Stream name lands in the suffix slot when the URL has one segment.
        let raw = "SETUP rtsp://h/cam RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 400 Bad Request\r\n"));
    }

    #[test]
    fn trackless_setup_on_single_track_stream_works() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "resp: {resp}");
    }

    #[test]
    fn setup_multicast_tcp_is_461() {
        let (registry, _) = single_track_registry(
            ScriptedSubsession::new("track1").with_multicast_group("232.0.1.2".parse().unwrap()),
        );
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP/TCP;unicast\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 461 Unsupported Transport\r\nCSeq: 3\r\n"));
        assert!(!handler.session_active());
    }

    #[test]
    fn setup_multicast_udp_reports_port_and_ttl() {
        let (registry, _) = single_track_registry(
            ScriptedSubsession::new("track1")
                .with_multicast_group("232.0.1.2".parse().unwrap())
                .with_server_ports(7000, 7001),
        );
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;multicast\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(
            resp.contains("RTP/AVP;multicast;destination=232.0.1.2;source=127.0.0.1;port=7000-7001;ttl=255"),
            "resp: {resp}"
        );
    }

    #[test]
    fn setup_raw_udp_echoes_mode_string() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: MP2T/H2221/UDP;unicast;client_port=5000\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(
            resp.contains("Transport: MP2T/H2221/UDP;unicast;"),
            "resp: {resp}"
        );
        assert!(resp.contains("client_port=5000;server_port=6970"), "resp: {resp}");
    }

    #[test]
    fn setup_with_play_now_latches_stream_after_setup() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));

        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\nx-playNow: yes\r\n\r\n";
        let _ = handler.handle(&parse(raw), raw);
        assert!(handler.stream_after_setup());

        // An ordinary SETUP clears it again.
        let raw2 = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 4\r\n\
                    Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let _ = handler.handle(&parse(raw2), raw2);
        assert!(!handler.stream_after_setup());
    }

    fn set_up_single_track(handler: &mut MethodHandler) {
        let raw = "SETUP rtsp://h/cam/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw);
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn play_clamps_range_to_duration() {
        let (registry, sub) =
            single_track_registry(ScriptedSubsession::new("track1").with_duration(30.0));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 4\r\nRange: npt=50.0-100.0\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.contains("Range: npt=30.000-30.000\r\n"), "resp: {resp}");

        // The seek the media layer saw was the clamped start.
        let events = sub.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Seek(1, _, npt) if *npt == 30.0)));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Start(1, _))));
    }

    #[test]
    fn play_reports_rtp_info() {
        let (registry, _) = single_track_registry(
            ScriptedSubsession::new("track1").with_sync(4242, 890_123),
        );
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 4\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(
            resp.contains("RTP-Info: url=rtsp://127.0.0.1:8554/cam/track1;seq=4242;rtptime=890123"),
            "resp: {resp}"
        );
        // No Range or Scale headers came back because none were sent.
        assert!(!resp.contains("Range:"));
        assert!(!resp.contains("Scale:"));
    }

    #[test]
    fn play_echoes_adjusted_scale() {
        let (registry, sub) =
            single_track_registry(ScriptedSubsession::new("track1").with_max_scale(2.0));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 4\r\nScale: 8.0\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.contains("Scale: 2.000000\r\n"), "resp: {resp}");
        assert!(sub
            .events()
            .iter()
            .any(|e| matches!(e, StreamEvent::SetScale(1, _, s) if *s == 2.0)));
    }

    #[test]
    fn play_open_range_echoes_open_range() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        // Live stream (duration 0): the range stays open-ended.
        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 4\r\nRange: npt=0.0-\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.contains("Range: npt=0.000-\r\n"), "resp: {resp}");
    }

    #[test]
    fn play_after_failed_media_setup_has_empty_rtp_info() {
        let (registry, sub) =
            single_track_registry(ScriptedSubsession::new("track1").failing_setup());
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PLAY rtsp://h/cam RTSP/1.0\r\nCSeq: 4\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(!resp.contains("RTP-Info:"));
        assert!(sub.events().is_empty());
    }

    #[test]
    fn pause_is_idempotent() {
        let (registry, sub) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PAUSE rtsp://h/cam RTSP/1.0\r\nCSeq: 5\r\n\r\n";
        let first = handler.handle(&parse(raw), raw);
        let second = handler.handle(&parse(raw), raw);
        assert_eq!(first.status_code, 200);
        assert_eq!(second.status_code, 200);
        assert_eq!(
            sub.events()
                .iter()
                .filter(|e| matches!(e, StreamEvent::Pause(..)))
                .count(),
            2
        );
    }

    #[test]
    fn get_parameter_keeps_session_alive() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "GET_PARAMETER rtsp://h/cam RTSP/1.0\r\nCSeq: 6\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 6\r\n"));
        assert!(resp.contains("Session: 1\r\n"));
        assert!(handler.session_active());
    }

    #[test]
    fn set_parameter_is_405() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "SET_PARAMETER rtsp://h/cam RTSP/1.0\r\nCSeq: 7\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 405 Method Not Allowed\r\n"));
    }

    #[test]
    fn teardown_deactivates_and_release_frees_binding() {
        let (registry, sub) = single_track_registry(ScriptedSubsession::new("track1"));
        let ctx = context(registry.clone());
        let (mut handler, _client) = handler_for(ctx);
        set_up_single_track(&mut handler);

        let session = registry.lookup("cam").unwrap();
        assert_eq!(session.reference_count(), 1);

        let raw = "TEARDOWN rtsp://h/cam RTSP/1.0\r\nCSeq: 8\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 8\r\n"));
        assert!(!handler.session_active());

        // The connection tears everything down after sending the response.
        handler.release();
        assert_eq!(session.reference_count(), 0);
        assert!(sub
            .events()
            .iter()
            .any(|e| matches!(e, StreamEvent::Delete(1, _))));
    }

    #[test]
    fn rebinding_to_another_stream_releases_the_first() {
        let registry = StreamRegistry::new();
        let (registry, first_sub) = {
            let mut session = crate::media::MediaSession::new("one", "One");
            let sub = Arc::new(ScriptedSubsession::new("track1"));
            session.add_subsession(sub.clone());
            registry.add(Arc::new(session));
            (registry, sub)
        };
        let mut second = crate::media::MediaSession::new("two", "Two");
        second.add_subsession(Arc::new(ScriptedSubsession::new("track1")));
        registry.add(Arc::new(second));

        let (mut handler, _client) = handler_for(context(registry.clone()));

        let raw = "SETUP rtsp://h/one/track1 RTSP/1.0\r\nCSeq: 2\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        assert_eq!(handler.handle(&parse(raw), raw).status_code, 200);
        let one = registry.lookup("one").unwrap();
        assert_eq!(one.reference_count(), 1);

        let raw = "SETUP rtsp://h/two/track1 RTSP/1.0\r\nCSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        assert_eq!(handler.handle(&parse(raw), raw).status_code, 200);

        // The old binding was fully released, tokens included.
        assert_eq!(one.reference_count(), 0);
        assert!(first_sub
            .events()
            .iter()
            .any(|e| matches!(e, StreamEvent::Delete(1, _))));
        assert_eq!(registry.lookup("two").unwrap().reference_count(), 1);
    }

    #[test]
    fn play_on_wrong_stream_name_is_404() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let (mut handler, _client) = handler_for(context(registry));
        set_up_single_track(&mut handler);

        let raw = "PLAY rtsp://h/other RTSP/1.0\r\nCSeq: 4\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 404 Stream Not Found\r\n"));
    }

    #[test]
    fn digest_challenge_then_success() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let db = Arc::new(AuthDatabase::new("R"));
        db.add_user("alice", "s3cret");
        let ctx = Arc::new(ServerContext {
            registry,
            auth_db: Some(db),
            access_check: None,
            server_port: 8554,
            receiving_interface: None,
            allow_client_destination: false,
            reclamation_timeout_secs: 0,
        });
        let (mut handler, _client) = handler_for(ctx);

        // First DESCRIBE carries no credentials: expect a challenge.
        let raw = "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\n"));
        let nonce = resp
            .lines()
            .find(|l| l.starts_with("WWW-Authenticate:"))
            .and_then(|l| l.split("nonce=\"").nth(1))
            .and_then(|l| l.split('"').next())
            .expect("challenge contains a nonce")
            .to_string();

        // Second attempt answers the challenge.
        let uri = "rtsp://h/cam";
        let response =
            auth::compute_digest_response("alice", "R", "s3cret", false, &nonce, "DESCRIBE", uri);
        let raw = format!(
            "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 3\r\n\
             Authorization: Digest username=\"alice\", realm=\"R\", nonce=\"{nonce}\", \
             uri=\"{uri}\", response=\"{response}\"\r\n\r\n"
        );
        let resp = handler.handle(&parse(&raw), &raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 3\r\n"), "resp: {resp}");
        assert!(resp.contains("application/sdp"));
    }

    #[test]
    fn digest_wrong_password_gets_fresh_challenge() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let db = Arc::new(AuthDatabase::new("R"));
        db.add_user("alice", "s3cret");
        let ctx = Arc::new(ServerContext {
            registry,
            auth_db: Some(db),
            access_check: None,
            server_port: 8554,
            receiving_interface: None,
            allow_client_destination: false,
            reclamation_timeout_secs: 0,
        });
        let (mut handler, _client) = handler_for(ctx);

        let raw = "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let first = handler.handle(&parse(raw), raw).serialize();
        let first_nonce = first.split("nonce=\"").nth(1).unwrap().split('"').next().unwrap();

        let response = auth::compute_digest_response(
            "alice",
            "R",
            "wrong",
            false,
            first_nonce,
            "DESCRIBE",
            "rtsp://h/cam",
        );
        let raw = format!(
            "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 3\r\n\
             Authorization: Digest username=\"alice\", realm=\"R\", nonce=\"{first_nonce}\", \
             uri=\"rtsp://h/cam\", response=\"{response}\"\r\n\r\n"
        );
        let second = handler.handle(&parse(&raw), &raw).serialize();
        assert!(second.starts_with("RTSP/1.0 401 Unauthorized\r\n"));
        // The failure rotated the nonce.
        let second_nonce = second.split("nonce=\"").nth(1).unwrap().split('"').next().unwrap();
        assert_ne!(first_nonce, second_nonce);
        // The connection stays open for another attempt.
        assert!(handler.session_active());
    }

    #[test]
    fn access_check_refusal_is_plain_401() {
        let (registry, _) = single_track_registry(ScriptedSubsession::new("track1"));
        let ctx = Arc::new(ServerContext {
            registry,
            auth_db: None,
            access_check: Some(Arc::new(|_, _, _| false)),
            server_port: 8554,
            receiving_interface: None,
            allow_client_destination: false,
            reclamation_timeout_secs: 0,
        });
        let (mut handler, _client) = handler_for(ctx);

        let raw = "DESCRIBE rtsp://h/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\n"));
        assert!(!resp.contains("WWW-Authenticate"));
    }

    #[test]
    fn unknown_method_is_405() {
        let (mut handler, _client) = handler_for(context(StreamRegistry::new()));
        let raw = "RECORD rtsp://h/cam RTSP/1.0\r\nCSeq: 9\r\n\r\n";
        let resp = handler.handle(&parse(raw), raw).serialize();
        assert!(resp.starts_with("RTSP/1.0 405 Method Not Allowed\r\nCSeq: 9\r\n"));
    }
}
