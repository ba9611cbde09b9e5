//! ytdeck server binary

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ytdeck::download::Engine;
use ytdeck::server;
use ytdeck::utils;

/// ytdeck - list channels and download videos through yt-dlp
#[derive(Parser, Debug)]
#[command(name = "ytdeck")]
#[command(about = "Web front-end for listing channels and downloading videos with yt-dlp")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(long, env = "YTDECK_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "YTDECK_PORT", default_value = "8765")]
    port: u16,

    /// yt-dlp executable (auto-detected when omitted)
    #[arg(long, env = "YTDECK_ENGINE")]
    engine: Option<PathBuf>,

    /// Netscape cookies file passed to yt-dlp (default: ./cookies.txt if present)
    #[arg(long, env = "YTDECK_COOKIES")]
    cookies: Option<PathBuf>,

    /// Where downloaded media is written
    #[arg(long, env = "YTDECK_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Directory of browser assets served at /
    #[arg(long, env = "YTDECK_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "YTDECK_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cookies = utils::resolve_cookies(args.cookies, Path::new(utils::DEFAULT_COOKIES_FILE));
    let engine = Engine::detect(args.engine, cookies);
    let engine_version = engine.version().await;
    let download_dir = args.download_dir.unwrap_or_else(utils::get_download_dir);

    println!();
    println!("========================================================");
    println!("  ytdeck v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================================");
    println!("  HTTP:      http://{}:{}", args.host, args.port);
    println!(
        "  yt-dlp:    {} [{}]",
        engine.program().display(),
        engine_version.as_deref().unwrap_or("NOT FOUND")
    );
    println!(
        "  deno:      {}",
        if engine.has_js_runtime() { "OK" } else { "not found (optional)" }
    );
    println!(
        "  Cookies:   {}",
        engine
            .cookies()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("  Downloads: {}", download_dir.display());
    if let Some(dir) = &args.static_dir {
        println!("  Static:    {}", dir.display());
    }
    println!("========================================================");
    println!();

    let config = server::ServerConfig {
        host: args.host,
        port: args.port,
        engine,
        engine_version,
        download_dir,
        static_dir: args.static_dir,
    };

    if let Err(e) = server::run(config).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
