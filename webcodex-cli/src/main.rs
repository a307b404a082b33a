use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Root directory terminal sessions are confined to
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = webcodex_core::load_config()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    config.debug |= cli.debug;

    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if config.debug {
        debug!("Debug logging enabled");
        match webcodex_core::get_config_path() {
            Ok(path) if path.exists() => debug!("Loaded config from: {:?}", path),
            _ => debug!("No config file, using defaults and environment"),
        }
        debug!("Config: {:?}", config.redacted());
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let listener = match webcodex_core::bind_http_server(config.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) =
        webcodex_core::serve_http_server_with_shutdown(config, listener, shutdown).await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
