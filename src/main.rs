//! ingressd entry point.

use std::path::PathBuf;

use clap::Parser;

use ingressd::config::{self, Config, Overrides};
use ingressd::{http, logging};

#[derive(Parser)]
#[command(
    name = "ingressd",
    version,
    about = "Listen for event notifications over HTTP webhooks, WebSockets, and Pub/Sub"
)]
struct Cli {
    /// Simple setup, but unsafe for production.
    #[arg(long)]
    dev: bool,

    /// Path to the TOML config file (defaults to the XDG config directory).
    #[arg(long, env = "INGRESSD_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Port for the webhook HTTP server.
    #[arg(long, env = "INGRESSD_WEBHOOK_PORT")]
    webhook_port: Option<u16>,

    /// Base address of a local OAuth server to pass callbacks through to.
    #[arg(long, env = "INGRESSD_OAUTH_HTTP_ADDR")]
    oauth_http_addr: Option<String>,

    /// Address of the secrets gRPC server.
    #[arg(long, env = "INGRESSD_SECRETS_SERVER_ADDR")]
    secrets_server_addr: Option<String>,

    /// PEM file with the secrets server's CA certificate.
    #[arg(long, env = "INGRESSD_SECRETS_SERVER_CA_CERT")]
    secrets_server_ca_cert: Option<PathBuf>,

    /// PEM file with this client's certificate, for mutual TLS.
    #[arg(long, env = "INGRESSD_SECRETS_CLIENT_CERT")]
    secrets_client_cert: Option<PathBuf>,

    /// PEM file with this client's private key, for mutual TLS.
    #[arg(long, env = "INGRESSD_SECRETS_CLIENT_KEY")]
    secrets_client_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match &cli.config_file {
        Some(path) => path.clone(),
        None => config::config_file()?,
    };
    let file = config::load_file(&path)?;

    let cfg = Config::resolve(
        Overrides {
            dev: cli.dev,
            webhook_port: cli.webhook_port,
            oauth_base_addr: cli.oauth_http_addr,
            secrets_addr: cli.secrets_server_addr,
            secrets_server_ca_cert: cli.secrets_server_ca_cert,
            secrets_client_cert: cli.secrets_client_cert,
            secrets_client_key: cli.secrets_client_key,
        },
        file,
    );

    logging::init(cfg.dev);
    http::run(cfg).await
}
