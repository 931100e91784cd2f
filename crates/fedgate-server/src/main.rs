//! fedgate-server: Dialback federation gateway.
//!
//! Bridges a local chat/presence proxy to a remote XMPP server over the
//! server-to-server federation port, authenticating both directions with
//! dialback keys (XEP-0220) and optional STARTTLS.

mod authorizing;
mod config;
mod connection;
mod context;
mod initiating;
mod ping;
mod processor;
mod receiving;
mod session;
mod tls;

use clap::Parser;
use config::{CliOverrides, GatewayConfig};
use processor::{LoggingNotifier, LoggingProcessor};
use session::DialbackSession;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// fedgate-server: dialback federation gateway
#[derive(Parser, Debug)]
#[command(name = "fedgate-server", version, about = "Dialback federation gateway")]
struct Cli {
    /// Federation listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Local domain this gateway speaks for
    #[arg(long)]
    local_domain: Option<String>,

    /// Remote server domain to federate with
    #[arg(long)]
    remote_domain: Option<String>,

    /// Host to dial for the outbound connection (defaults to the remote domain)
    #[arg(long)]
    connect_host: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Require TLS before dialback
    #[arg(long)]
    tls_required: bool,

    /// Config file path
    #[arg(long, default_value = "~/.fedgate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting fedgate-server"
    );

    tls::init_crypto();

    let (cert_override, key_override) = if cli.generate_cert {
        match tls::generate_self_signed() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert, cli.key)
    };

    let config_path = PathBuf::from(&cli.config);
    let cfg = match GatewayConfig::load(
        Some(&config_path),
        CliOverrides {
            local_domain: cli.local_domain,
            remote_domain: cli.remote_domain,
            port: cli.port,
            connect_host: cli.connect_host,
            cert: cert_override,
            key: key_override,
            tls_required: if cli.tls_required { Some(true) } else { None },
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let acceptor = match tls::load_acceptor(&cfg.cert_path, &cfg.key_path) {
        Ok(a) => Some(a),
        Err(e) if cfg.tls_required => {
            error!(error = %e, "TLS required but no usable certificate");
            std::process::exit(1);
        }
        Err(e) => {
            warn!(error = %e, "no server certificate, inbound starttls disabled");
            None
        }
    };

    let connector = match tls::build_connector(cfg.accept_self_signed) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build TLS connector");
            std::process::exit(1);
        }
    };

    let session = Arc::new(DialbackSession::new(
        cfg,
        acceptor,
        connector,
        Arc::new(LoggingProcessor),
        Arc::new(LoggingNotifier),
    ));

    tokio::select! {
        result = Arc::clone(&session).run() => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            session.shutdown();
        }
    }

    info!("fedgate-server stopped");
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
