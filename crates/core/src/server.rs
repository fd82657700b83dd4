use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};

use crate::auth::AuthDatabase;
use crate::error::{Result, RtspError};
use crate::media::MediaSession;
use crate::registry::StreamRegistry;
use crate::transport::tcp;

/// Default RTSP port (RFC 2326 §9.2). Elided from generated URLs.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Listen backlog for the RTSP control socket.
const LISTEN_BACKLOG: i32 = 20;

/// Send-buffer size applied to the listening socket and every client
/// socket, large enough that a full response (SDP included) always fits in
/// one send.
pub(crate) const SEND_BUFFER_SIZE: usize = 50 * 1024;

/// Host-supplied access hook consulted before authentication on DESCRIBE:
/// `(client socket, peer address, url suffix) -> allow`.
pub type AccessCheck = Arc<dyn Fn(&TcpStream, SocketAddr, &str) -> bool + Send + Sync>;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on. 0 lets the kernel pick; the chosen port is
    /// returned by [`Server::start`].
    pub port: u16,
    /// Seconds of client silence before a connection is reclaimed.
    /// 0 disables reclamation.
    pub reclamation_timeout_secs: u64,
    /// Interface address used in URLs when the client socket's local
    /// address cannot be determined.
    pub receiving_interface: Option<IpAddr>,
    /// Honor a client-supplied `destination=` in the Transport header.
    /// Off by default: redirecting media at a third party is a
    /// denial-of-service vector, so only enable this for trusted clients.
    pub allow_client_destination: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_RTSP_PORT,
            reclamation_timeout_secs: 65,
            receiving_interface: None,
            allow_client_destination: false,
        }
    }
}

/// Shared state the per-connection handlers need, frozen at start time.
pub(crate) struct ServerContext {
    pub registry: StreamRegistry,
    pub auth_db: Option<Arc<AuthDatabase>>,
    pub access_check: Option<AccessCheck>,
    /// The actually-bound port, for generated URLs.
    pub server_port: u16,
    pub receiving_interface: Option<IpAddr>,
    pub allow_client_destination: bool,
    pub reclamation_timeout_secs: u64,
}

/// The RTSP control-plane server.
///
/// Owns the stream registry and the listening socket; accepted connections
/// are handled on their own threads by [`crate::transport::tcp`]. Media
/// sessions are registered through the administrative API
/// ([`add_session`](Self::add_session) and friends) at any time, before or
/// after [`start`](Self::start).
///
/// # Usage
///
/// ```no_run
/// use std::sync::Arc;
/// use rtsp_control::{MediaSession, Server, ServerConfig};
///
/// let mut server = Server::with_config(ServerConfig {
///     port: 8554,
///     ..ServerConfig::default()
/// });
/// let mut session = MediaSession::new("cam", "Back Yard");
/// // session.add_subsession(Arc::new(my_track));
/// server.add_session(Arc::new(session));
/// let port = server.start().unwrap();
/// println!("rtsp://127.0.0.1:{port}/cam");
/// ```
pub struct Server {
    config: ServerConfig,
    registry: StreamRegistry,
    auth_db: Option<Arc<AuthDatabase>>,
    access_check: Option<AccessCheck>,
    running: Arc<AtomicBool>,
    session_id_counter: Arc<AtomicU32>,
    bound_port: Option<u16>,
}

impl Server {
    /// Create a server with the default configuration (port 554,
    /// 65-second reclamation).
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Server {
            config,
            registry: StreamRegistry::new(),
            auth_db: None,
            access_check: None,
            running: Arc::new(AtomicBool::new(false)),
            session_id_counter: Arc::new(AtomicU32::new(0)),
            bound_port: None,
        }
    }

    /// Require HTTP-Digest authentication against `db` for DESCRIBE.
    pub fn set_auth_database(&mut self, db: Arc<AuthDatabase>) {
        self.auth_db = Some(db);
    }

    /// Install a pre-authentication access hook (e.g. an address allowlist).
    pub fn set_access_check(&mut self, check: AccessCheck) {
        self.access_check = Some(check);
    }

    /// Register a media session under its stream name, replacing (and
    /// retiring) any existing session with that name.
    pub fn add_session(&self, session: Arc<MediaSession>) {
        self.registry.add(session);
    }

    /// Unregister a stream. Destruction is deferred while connections are
    /// still bound to it.
    pub fn remove_session(&self, name: &str) {
        self.registry.remove(name);
    }

    pub fn lookup_session(&self, name: &str) -> Option<Arc<MediaSession>> {
        self.registry.lookup(name)
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<MediaSession>> {
        self.registry.sessions()
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns the bound port, useful when the configured port was 0 and
    /// the kernel chose one.
    pub fn start(&mut self) -> Result<u16> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = bind_listener(self.config.port)?;
        let port = listener.local_addr()?.port();
        self.bound_port = Some(port);

        self.running.store(true, Ordering::SeqCst);

        let ctx = Arc::new(ServerContext {
            registry: self.registry.clone(),
            auth_db: self.auth_db.clone(),
            access_check: self.access_check.clone(),
            server_port: port,
            receiving_interface: self.config.receiving_interface,
            allow_client_destination: self.config.allow_client_destination,
            reclamation_timeout_secs: self.config.reclamation_timeout_secs,
        });

        let running = self.running.clone();
        let session_ids = self.session_id_counter.clone();

        tracing::info!(port, "RTSP server listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, ctx, running, session_ids);
        });

        Ok(port)
    }

    /// Ask the accept loop to wind down. Existing connections finish their
    /// current request and exit on their next loop iteration.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The port the server is bound to, once started.
    pub fn port(&self) -> Option<u16> {
        self.bound_port
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the listening socket: address reuse, a large send buffer, and a
/// backlog deep enough for bursts of simultaneous clients.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// URL prefix for generated RTSP URLs: `rtsp://ip[:port]/`, with the port
/// elided when it is the protocol default.
pub(crate) fn rtsp_url_prefix(ip: IpAddr, port: u16) -> String {
    if port == DEFAULT_RTSP_PORT {
        format!("rtsp://{ip}/")
    } else {
        format!("rtsp://{ip}:{port}/")
    }
}
