use crate::error::{ParseErrorKind, Result, RtspError};

/// Capacity of the per-connection request buffer.
///
/// A single RTSP request (including all headers) must fit; a request that
/// grows past this is treated as hostile and the connection is dropped.
pub const REQUEST_BUFFER_SIZE: usize = 10_000;

/// Accumulates raw bytes from the client socket until a complete RTSP
/// request has arrived.
///
/// RTSP requests end at the first CR LF CR LF. Reads from a TCP socket can
/// split a request at any byte, including between the CR and LF of the
/// terminator, so the scan resumes one byte before the newly arrived data
/// and remembers the position of the last CR LF seen across reads.
pub struct RequestBuffer {
    buf: Box<[u8; REQUEST_BUFFER_SIZE]>,
    bytes_seen: usize,
    /// Position of the most recently observed CR LF pair. Starts at -3 so
    /// that a terminator at the very start of the buffer is detected.
    last_crlf: isize,
    complete: bool,
}

impl RequestBuffer {
    pub fn new() -> Self {
        RequestBuffer {
            buf: Box::new([0; REQUEST_BUFFER_SIZE]),
            bytes_seen: 0,
            last_crlf: -3,
            complete: false,
        }
    }

    /// Forget the current request, preparing for the next one.
    pub fn reset(&mut self) {
        self.bytes_seen = 0;
        self.last_crlf = -3;
        self.complete = false;
    }

    /// The writable remainder of the buffer. Empty means the request has
    /// overflowed the buffer and the connection must be dropped.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.bytes_seen..]
    }

    /// Record that `n` bytes were read into [`space`](Self::space) and scan
    /// the new bytes for the end-of-message terminator.
    ///
    /// Returns `true` once a complete request is buffered.
    pub fn commit(&mut self, n: usize) -> bool {
        debug_assert!(self.bytes_seen + n <= REQUEST_BUFFER_SIZE);

        // Re-inspect the byte before the new data in case the previous read
        // ended with a CR.
        let mut i = self.bytes_seen.saturating_sub(1);
        let end = self.bytes_seen + n;
        while i + 1 < end {
            if self.buf[i] == b'\r' && self.buf[i + 1] == b'\n' {
                if i as isize - self.last_crlf == 2 {
                    self.complete = true;
                    break;
                }
                self.last_crlf = i as isize;
            }
            i += 1;
        }

        self.bytes_seen = end;
        self.complete
    }

    /// The bytes accumulated so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.bytes_seen]
    }
}

impl Default for RequestBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed RTSP request line plus its CSeq (RFC 2326 §6).
///
/// The request URL is reduced to the two components the command handlers
/// care about: everything between the host part and the last `/` becomes
/// `url_pre_suffix`, the remainder `url_suffix`. For
/// `rtsp://host/cam/track2` that is `("cam", "track2")`; for
/// `rtsp://host/cam` it is `("", "cam")`. Either component may be empty,
/// and a `*` request URL is carried whole in `url_suffix`.
#[derive(Debug, Clone)]
pub struct Request {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, ...).
    pub method: String,
    /// URL path up to the last `/`, without a leading slash.
    pub url_pre_suffix: String,
    /// URL path after the last `/`.
    pub url_suffix: String,
    /// CSeq header value, echoed verbatim in the response. Empty when the
    /// client sent no CSeq header.
    pub cseq: String,
}

impl Request {
    /// Parse a complete RTSP request.
    ///
    /// Only the request line and CSeq are extracted here; the remaining
    /// headers (Transport, Range, Scale, Authorization) are scanned on
    /// demand by [`headers`](crate::protocol::headers) because each command
    /// cares about a different subset.
    pub fn parse(raw: &str) -> Result<Self> {
        let request_line = raw
            .lines()
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0];
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidMethod,
            });
        }

        if parts[2] != "RTSP/1.0" {
            tracing::warn!(version = parts[2], "client sent non-RTSP/1.0 version");
        }

        let (url_pre_suffix, url_suffix) = split_url(parts[1]);

        Ok(Request {
            method: method.to_string(),
            url_pre_suffix,
            url_suffix,
            cseq: find_cseq(raw).unwrap_or_default(),
        })
    }
}

/// Split a request URL into pre-suffix and suffix.
///
/// Strips the `rtsp://host[:port]/` prefix and any `?query`, then splits at
/// the last remaining `/`.
fn split_url(url: &str) -> (String, String) {
    let path = if let Some(rest) = url.strip_prefix("rtsp://") {
        match rest.find('/') {
            Some(slash) => &rest[slash + 1..],
            None => "",
        }
    } else {
        url.trim_start_matches('/')
    };

    let path = &path[..path.find('?').unwrap_or(path.len())];

    match path.rfind('/') {
        Some(slash) => (path[..slash].to_string(), path[slash + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

/// Locate the CSeq header (case-insensitive name) and return its value
/// verbatim.
fn find_cseq(raw: &str) -> Option<String> {
    for line in raw.lines().skip(1) {
        if let Some(colon) = line.find(':') {
            if line[..colon].trim().eq_ignore_ascii_case("CSeq") {
                return Some(line[colon + 1..].trim().to_string());
            }
        }
    }
    None
}
