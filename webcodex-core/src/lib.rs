pub mod config;
pub mod liveness;
pub mod paths;
pub mod process;
pub mod registry;
pub mod server;
pub mod ws;

pub use config::{get_config_path, load_config, Config, ConfigError};
pub use server::{
    bind_http_server, build_router, serve_http_server, serve_http_server_with_shutdown,
    start_http_server,
};
