/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Date: Thu, Jan 15 2026 10:32:45 GMT\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
/// Header order is preserved: handlers add `CSeq` first so that responses
/// begin `RTSP/1.0 <status>\r\nCSeq: <n>\r\n`, which some clients rely on.
#[must_use]
pub struct Response {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Value of the `Public:` and `Allow:` headers: every method this server
/// understands.
pub const ALLOWED_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER";

impl Response {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Response {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// 200 OK (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request: unparseable request or malformed SETUP.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 Unauthorized: access check or digest verification failed.
    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    /// 404 for a stream or track that is not registered.
    pub fn stream_not_found() -> Self {
        Self::new(404, "Stream Not Found")
    }

    /// 404 for a stream whose session description could not be built.
    pub fn description_unavailable() -> Self {
        Self::new(404, "File Not Found, Or In Incorrect Format")
    }

    /// 405 Method Not Allowed.
    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed")
    }

    /// 461 Unsupported Transport, e.g. TCP interleaving on a multicast
    /// stream.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Append the `Date:` header in the RTSP-conventional GMT format.
    pub fn with_date(self) -> Self {
        let date = chrono::Utc::now().format("%a, %b %d %Y %H:%M:%S GMT");
        self.add_header("Date", &date.to_string())
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}
