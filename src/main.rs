//! Trusted Agent Protocol - trust gateway and certificate authority

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tap_gateway::{
    authority::{self, CaStore, CertificateAuthority},
    cli::{CaCommand, Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Authority { port, data_dir }) => {
            run_authority(config, port, data_dir.as_deref()).await
        }
        Some(Command::Ca(cmd)) => run_ca_command(&config, cmd),
        Some(Command::Gateway {
            port,
            host,
            plaintext,
        }) => run_gateway(config, port, host, plaintext).await,
        None => run_gateway(config, None, None, false).await,
    }
}

/// Run the trust gateway
async fn run_gateway(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
    plaintext: bool,
) -> ExitCode {
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if plaintext {
        config.gateway.tls.enabled = false;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.gateway.port,
        tls = config.gateway.tls.enabled,
        "Starting trust gateway"
    );

    let gateway = match Gateway::from_config(config.gateway).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));

    if let Err(e) = gateway.serve(shutdown_rx).await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Run the certificate authority service
async fn run_authority(mut config: Config, port: Option<u16>, data_dir: Option<&Path>) -> ExitCode {
    if let Some(port) = port {
        config.authority.port = port;
    }
    if let Some(dir) = data_dir {
        config.authority.data_dir = Some(dir.to_string_lossy().into_owned());
    }

    let addr = match config.authority.host.parse() {
        Ok(ip) => SocketAddr::new(ip, config.authority.port),
        Err(e) => {
            error!("Invalid authority host: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ca = match CertificateAuthority::initialize(&config.authority) {
        Ok(ca) => Arc::new(ca),
        Err(e) => {
            error!("Failed to initialize certificate authority: {e}");
            return ExitCode::FAILURE;
        }
    };
    if config.authority.data_dir.is_none() {
        warn!("No data_dir configured - the root CA will not survive a restart");
    }

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));
    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };

    if let Err(e) = authority::serve(ca, addr, shutdown).await {
        error!("Authority error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Authority shutdown complete");
    ExitCode::SUCCESS
}

/// Run offline CA commands
fn run_ca_command(config: &Config, cmd: CaCommand) -> ExitCode {
    match cmd {
        CaCommand::Init { dir } => {
            let authority = tap_gateway::config::AuthorityConfig {
                data_dir: Some(dir.to_string_lossy().into_owned()),
                ..config.authority.clone()
            };
            match CertificateAuthority::initialize(&authority) {
                Ok(_) => {
                    println!("✅ Root CA ready in {}", dir.display());
                    println!("   {}", dir.join(authority::store::CERT_FILE).display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to initialize CA: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        CaCommand::IssueServerCert {
            dir,
            hosts,
            out,
            stem,
        } => {
            let stored = match CaStore::new(&dir).load() {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    eprintln!(
                        "❌ No root CA in {} (run `tap-gateway ca init --dir {}` first)",
                        dir.display(),
                        dir.display()
                    );
                    return ExitCode::FAILURE;
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    return ExitCode::FAILURE;
                }
            };
            let issued = CertificateAuthority::from_stored(&stored, config.authority.validity_days)
                .and_then(|ca| ca.issue_server_certificate(&hosts))
                .and_then(|cert| cert.write_to_dir(&out, &stem));
            match issued {
                Ok(()) => {
                    println!("✅ Server certificate for {}", hosts.join(", "));
                    println!("   {}", out.join(format!("{stem}.crt")).display());
                    println!("   {}", out.join(format!("{stem}.key")).display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to issue server certificate: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
