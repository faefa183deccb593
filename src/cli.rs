//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Trusted Agent Protocol - trust gateway and certificate authority
#[derive(Parser, Debug)]
#[command(name = "tap-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TAP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TAP_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TAP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to the gateway)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the trust gateway (default)
    Gateway {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Serve plain TCP instead of TLS
        #[arg(long)]
        plaintext: bool,
    },

    /// Run the certificate authority HTTP service
    Authority {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory holding ca-key.pem / ca-cert.pem
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Offline CA operations
    #[command(subcommand)]
    Ca(CaCommand),
}

/// Offline CA subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create the root CA in a directory (reuses an existing one)
    Init {
        /// Directory holding ca-key.pem / ca-cert.pem
        #[arg(long, required = true)]
        dir: PathBuf,
    },

    /// Issue a TLS server certificate for the gateway from the root CA
    IssueServerCert {
        /// Directory holding ca-key.pem / ca-cert.pem
        #[arg(long, required = true)]
        dir: PathBuf,

        /// Host names / IPs the certificate is valid for (first is the CN)
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,

        /// Output directory for <stem>.crt and <stem>.key
        #[arg(long, default_value = "tls")]
        out: PathBuf,

        /// Output file stem
        #[arg(long, default_value = "server")]
        stem: String,
    },
}
