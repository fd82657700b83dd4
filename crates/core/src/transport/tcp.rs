use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::liveness::{LivenessHandle, LivenessMonitor};
use crate::protocol::handler::MethodHandler;
use crate::protocol::request::{Request, RequestBuffer};
use crate::server::{ServerContext, SEND_BUFFER_SIZE};

/// How often a blocked read wakes up to check the liveness deadline and
/// the server's running flag.
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Server::stop`](crate::Server::stop) can terminate it promptly.
/// Each accepted client gets a monotone session id and its own thread.
pub(crate) fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    session_ids: Arc<AtomicU32>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = prepare_client_socket(&stream) {
                    tracing::warn!(%peer_addr, error = %e, "failed to prepare client socket");
                    continue;
                }
                let session_id = session_ids.fetch_add(1, Ordering::SeqCst) + 1;
                let ctx = ctx.clone();
                let running = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, peer_addr, session_id, ctx, running);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Blocking reads with a short timeout, and the same generous send buffer
/// as the listener so responses go out in a single send.
fn prepare_client_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(LIVENESS_POLL))?;
    socket2::SockRef::from(stream).set_send_buffer_size(SEND_BUFFER_SIZE)?;
    Ok(())
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: MethodHandler,
    request: RequestBuffer,
    liveness: LivenessHandle,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        session_id: u32,
        ctx: Arc<ServerContext>,
        running: Arc<AtomicBool>,
    ) {
        tracing::info!(%peer_addr, session_id, "client connected");

        let handler_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "could not clone client socket");
                return;
            }
        };

        let liveness: LivenessHandle =
            Arc::new(LivenessMonitor::new(ctx.reclamation_timeout_secs));
        let handler = MethodHandler::new(
            ctx,
            handler_stream,
            peer_addr,
            session_id,
            liveness.clone(),
        );

        let mut conn = Connection {
            stream,
            peer_addr,
            handler,
            request: RequestBuffer::new(),
            liveness,
        };

        let reason = conn.run(&running);
        conn.handler.release();

        tracing::info!(peer = %conn.peer_addr, session_id, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let space = self.request.space();
            if space.is_empty() {
                return "request exceeded buffer capacity";
            }

            let n = match self.stream.read(space) {
                Ok(0) => return "connection closed by client",
                Ok(n) => n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.liveness.expired() {
                        return "reclaimed after inactivity";
                    }
                    continue;
                }
                Err(_) => return "read error",
            };

            self.liveness.note_liveness();

            if !self.request.commit(n) {
                continue; // await the rest of the request
            }

            {
                let raw = String::from_utf8_lossy(self.request.as_bytes());
                match Request::parse(&raw) {
                    Ok(req) => {
                        tracing::debug!(
                            peer = %self.peer_addr,
                            method = %req.method,
                            pre = %req.url_pre_suffix,
                            suffix = %req.url_suffix,
                            "request"
                        );

                        let response = self.handler.handle(&req, &raw);
                        tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");
                        if self
                            .stream
                            .write_all(response.serialize().as_bytes())
                            .is_err()
                        {
                            return "write error";
                        }

                        // x-playNow / Range on SETUP: the client wants
                        // delivery immediately, so simulate the PLAY it
                        // chose not to send.
                        if req.method == "SETUP" && self.handler.stream_after_setup() {
                            let play = Request {
                                method: "PLAY".to_string(),
                                ..req
                            };
                            let response = self.handler.handle(&play, &raw);
                            if self
                                .stream
                                .write_all(response.serialize().as_bytes())
                                .is_err()
                            {
                                return "write error";
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                        let response = self.handler.bad_request();
                        if self
                            .stream
                            .write_all(response.serialize().as_bytes())
                            .is_err()
                        {
                            return "write error";
                        }
                    }
                }
            }

            self.request.reset(); // to prepare for any subsequent request

            if !self.handler.session_active() {
                return "session closed";
            }
        }

        "server shutting down"
    }
}
