use std::io;
use std::path::PathBuf;

use clap::Parser;
use rtsp_relay::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP server relaying ffmpeg-produced RTP over TCP, UDP and multicast"
)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Bind address (host:port), overrides the configuration file
    #[arg(long, short)]
    bind: Option<String>,

    /// Directory served as content, overrides the configuration file
    #[arg(long, short)]
    media_root: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(root) = args.media_root {
        config.media_root = root;
    }

    let bind = config.bind_addr.clone();
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    println!("RTSP relay on {} (press Enter to stop)", bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    server.stop();
}
