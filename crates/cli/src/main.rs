mod demo;

use std::io;
use std::sync::Arc;

use clap::Parser;
use rtsp_control::{auth::DEFAULT_REALM, AuthDatabase, MediaSession, Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "rtspd",
    about = "Standalone RTSP control-plane server with a demo stream"
)]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(long, short, default_value_t = 8554)]
    port: u16,

    /// Stream name the demo track is registered under
    #[arg(long, default_value = "demo")]
    stream: String,

    /// Seconds of client silence before a connection is reclaimed (0 disables)
    #[arg(long, default_value_t = 65)]
    reclaim_secs: u64,

    /// Require digest authentication as this user
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Password for --user
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Digest realm
    #[arg(long, default_value = DEFAULT_REALM)]
    realm: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut server = Server::with_config(ServerConfig {
        port: args.port,
        reclamation_timeout_secs: args.reclaim_secs,
        ..ServerConfig::default()
    });

    if let (Some(user), Some(password)) = (&args.user, &args.password) {
        let db = AuthDatabase::new(&args.realm);
        db.add_user(user, password);
        server.set_auth_database(Arc::new(db));
    }

    let mut session = MediaSession::new(&args.stream, "Demo Stream");
    session.add_subsession(Arc::new(demo::DemoSubsession::new()));
    server.add_session(Arc::new(session));

    let port = match server.start() {
        Ok(port) => port,
        Err(e) => {
            eprintln!("failed to start server: {e}");
            std::process::exit(1);
        }
    };

    println!("rtsp://127.0.0.1:{}/{} — press Enter to stop", port, args.stream);
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.stop();
}
