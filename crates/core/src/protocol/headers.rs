//! Single-pass header scanners for the request headers the command handlers
//! consume: `Transport`, `Range`, `Scale`, `x-playNow`, `Authorization`.
//!
//! Each scanner searches the raw request text for its header tag
//! (case-insensitive), then walks the value once without allocating per
//! field. Unrecognized fields are ignored, and a missing or malformed
//! header yields the documented defaults rather than an error; RTSP
//! clients are an unruly bunch and the protocol is forgiving here.

use std::net::IpAddr;

/// Sentinel channel id meaning "client did not ask for a specific
/// interleaved channel" (RFC 2326 §12.39 `interleaved` parameter absent).
pub const UNASSIGNED_CHANNEL_ID: u8 = 0xFF;

/// How the client asked for media to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// RTP over UDP (the default when no Transport header is present).
    RtpUdp,
    /// RTP interleaved on the RTSP TCP connection (`RTP/AVP/TCP`).
    RtpTcp,
    /// Raw UDP without RTP framing (`RAW/RAW/UDP` or `MP2T/H2221/UDP`).
    RawUdp,
}

/// Parsed `Transport:` request header (RFC 2326 §12.39).
#[derive(Debug, Clone)]
pub struct TransportSpec {
    pub mode: StreamingMode,
    /// The transport token verbatim, recorded for raw-UDP modes so the
    /// response can echo the exact spelling the client used.
    pub mode_string: Option<String>,
    /// Client-supplied destination address, honored only when the server is
    /// configured to allow it.
    pub destination: Option<IpAddr>,
    pub ttl: u8,
    pub client_rtp_port: u16,
    pub client_rtcp_port: u16,
    pub rtp_channel_id: u8,
    pub rtcp_channel_id: u8,
}

impl Default for TransportSpec {
    fn default() -> Self {
        TransportSpec {
            mode: StreamingMode::RtpUdp,
            mode_string: None,
            destination: None,
            ttl: 255,
            client_rtp_port: 0,
            client_rtcp_port: 1,
            rtp_channel_id: UNASSIGNED_CHANNEL_ID,
            rtcp_channel_id: UNASSIGNED_CHANNEL_ID,
        }
    }
}

/// Parse the `Transport:` header out of the raw request text.
///
/// Returns the defaults when the header is absent. Fields are evaluated in
/// order, so a mode token earlier in the header affects how a later
/// single-port `client_port=` is expanded.
pub fn parse_transport(raw: &str) -> TransportSpec {
    let mut spec = TransportSpec::default();

    let Some(value) = header_value(raw, "Transport:") else {
        return spec;
    };

    for field in value.split(';') {
        let field = field.trim();
        if field == "RTP/AVP/TCP" {
            spec.mode = StreamingMode::RtpTcp;
        } else if field == "RAW/RAW/UDP" || field == "MP2T/H2221/UDP" {
            spec.mode = StreamingMode::RawUdp;
            spec.mode_string = Some(field.to_string());
        } else if let Some(addr) = strip_prefix_ignore_case(field, "destination=") {
            spec.destination = addr.parse().ok();
        } else if let Some(ttl) = field.strip_prefix("ttl") {
            if let Ok(value) = ttl.parse::<u32>() {
                spec.ttl = value as u8;
            }
        } else if let Some(ports) = field.strip_prefix("client_port=") {
            match ports.split_once('-') {
                Some((rtp, rtcp)) => {
                    if let (Ok(rtp), Ok(rtcp)) = (rtp.parse(), rtcp.parse()) {
                        spec.client_rtp_port = rtp;
                        spec.client_rtcp_port = rtcp;
                    }
                }
                None => {
                    if let Ok(rtp) = ports.parse::<u16>() {
                        spec.client_rtp_port = rtp;
                        spec.client_rtcp_port = if spec.mode == StreamingMode::RawUdp {
                            0
                        } else {
                            rtp.wrapping_add(1)
                        };
                    }
                }
            }
        } else if let Some(ids) = field.strip_prefix("interleaved=") {
            if let Some((rtp, rtcp)) = ids.split_once('-') {
                if let (Ok(rtp), Ok(rtcp)) = (rtp.parse(), rtcp.parse()) {
                    spec.rtp_channel_id = rtp;
                    spec.rtcp_channel_id = rtcp;
                }
            }
        }
    }

    spec
}

/// Parse `Range: npt=<start>[-<end>]` (RFC 2326 §12.29).
///
/// Returns `(start, end)` in seconds; a missing end means "until the end"
/// and is reported as 0.0. `None` when the header is absent or malformed.
pub fn parse_range(raw: &str) -> Option<(f64, f64)> {
    let value = header_value(raw, "Range:")?;
    let npt = strip_prefix_ignore_case(value.trim(), "npt")?;
    let npt = npt.trim_start().strip_prefix('=')?.trim();

    // The dash is searched from the second character on so a negative
    // start time still splits in the right place.
    let dash = npt.get(1..)?.find('-').map(|i| i + 1)?;
    let (start, end) = npt.split_at(dash);
    let end = &end[1..];
    let start: f64 = start.trim().parse().ok()?;
    let end = end.trim();
    let end: f64 = if end.is_empty() { 0.0 } else { end.parse().ok()? };

    Some((start, end))
}

/// Parse `Scale: <factor>` (RFC 2326 §12.34). `None` when absent or
/// malformed, in which case playback proceeds at scale 1.0.
pub fn parse_scale(raw: &str) -> Option<f32> {
    header_value(raw, "Scale:")?.trim().parse().ok()
}

/// Whether the nonstandard `x-playNow:` header is present, asking the
/// server to start delivery right after SETUP without a separate PLAY.
pub fn has_play_now(raw: &str) -> bool {
    header_value(raw, "x-playNow:").is_some()
}

/// Fields of an `Authorization: Digest` header (RFC 2617 §3.2.2).
///
/// Keys are matched case-sensitively; values must be double-quoted and may
/// be empty. Fields the server does not use are skipped.
#[derive(Debug, Default)]
pub struct AuthorizationFields {
    pub username: Option<String>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub uri: Option<String>,
    pub response: Option<String>,
}

/// Parse the `Authorization: Digest` header, if present.
pub fn parse_authorization(raw: &str) -> Option<AuthorizationFields> {
    let value = header_value(raw, "Authorization: Digest ")?;
    let mut fields = AuthorizationFields::default();

    let mut rest = value.trim_start();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = &rest[..eq];
        let after = &rest[eq + 1..];
        let Some(quoted) = after.strip_prefix('"') else {
            break;
        };
        let Some(close) = quoted.find('"') else { break };
        let value = &quoted[..close];

        match key {
            "username" => fields.username = Some(value.to_string()),
            "realm" => fields.realm = Some(value.to_string()),
            "nonce" => fields.nonce = Some(value.to_string()),
            "uri" => fields.uri = Some(value.to_string()),
            "response" => fields.response = Some(value.to_string()),
            _ => {}
        }

        rest = quoted[close + 1..].trim_start_matches([',', ' ']);
    }

    Some(fields)
}

/// Find `tag` anywhere in the request text, matching case-insensitively,
/// and return the remainder of that line with leading spaces trimmed.
fn header_value<'a>(raw: &'a str, tag: &str) -> Option<&'a str> {
    let bytes = raw.as_bytes();
    let tag_bytes = tag.as_bytes();
    if bytes.len() < tag_bytes.len() {
        return None;
    }

    for start in 0..=bytes.len() - tag_bytes.len() {
        if bytes[start..start + tag_bytes.len()].eq_ignore_ascii_case(tag_bytes) {
            let rest = &raw[start + tag_bytes.len()..];
            let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
            return Some(rest[..end].trim_start());
        }
    }

    None
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    // Byte-wise compare first: an ASCII match guarantees the split point is
    // a character boundary even in otherwise non-ASCII input.
    if value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
