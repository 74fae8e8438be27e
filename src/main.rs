//! cachedns - A caching DNS resolver over UDP
//!
//! Answers queries from an in-memory TTL cache and resolves misses either
//! by forwarding to one upstream or by walking the hierarchy from the root
//! servers. The cache survives restarts through a JSON snapshot.

mod config;
mod dns;
mod error;
mod logging;

use config::{load_config, ResolutionMode};
use dns::run_dns_server;

use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = env::args().collect();

    // Parse command line arguments
    let mut config_path: Option<&str> = None;
    let mut cli_listen_addr: Option<String> = None;
    let mut cli_upstream: Option<String> = None;
    let mut cli_backup_file: Option<String> = None;
    let mut iterative = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config_path = args.get(i).map(|s| s.as_str());
            }
            "--listen" => {
                i += 1;
                cli_listen_addr = args.get(i).cloned();
            }
            "--upstream" => {
                i += 1;
                cli_upstream = args.get(i).cloned();
            }
            "--backup-file" => {
                i += 1;
                cli_backup_file = args.get(i).cloned();
            }
            "--iterative" => {
                iterative = true;
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage(&args[0]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // Load config from file
    let mut config = load_config(config_path)?;

    // CLI arguments override config file
    if let Some(addr) = cli_listen_addr {
        config.dns.listen = addr;
    }
    if let Some(upstream) = cli_upstream {
        config.dns.upstream = upstream;
        config.dns.strategy = ResolutionMode::Forward;
    }
    if iterative {
        config.dns.strategy = ResolutionMode::Iterative;
    }
    if let Some(path) = cli_backup_file {
        config.dns.cache.backup_file = Some(path);
    }

    // Initialize logging system
    let _log_guard = logging::init_logging(&config.logging);

    tracing::debug!(config = ?config, "Configuration loaded");

    println!("DNS server listening on {}", config.dns.listen);
    match config.dns.strategy {
        ResolutionMode::Forward => println!("DNS upstream: {}", config.dns.upstream),
        ResolutionMode::Iterative => println!(
            "DNS iterative resolution (max {} hops)",
            config.dns.max_hops
        ),
    }
    match &config.dns.cache.backup_file {
        Some(path) => println!("DNS cache snapshot: {}", path),
        None => println!("DNS cache snapshot: disabled"),
    }

    if let Err(e) = run_dns_server(&config.dns, config.logging.log_queries, shutdown_signal()).await {
        error!(error = %e, "DNS server error");
        return Err(e.into());
    }

    println!("DNS server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [options]", program);
    eprintln!();
    eprintln!("Caching DNS resolver over UDP (forwarding or iterative).");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <path>     Load config from YAML file");
    eprintln!("  --listen <addr>         Listen address (default: 0.0.0.0:53)");
    eprintln!("  --upstream <addr>       Forward to this upstream (default: 1.1.1.1:53)");
    eprintln!("  --iterative             Resolve iteratively from the root servers");
    eprintln!("  --backup-file <path>    Cache snapshot file (default: dns_cache.json)");
    eprintln!("  -h, --help              Show this help message");
    eprintln!();
    eprintln!("Config file (config.yaml):");
    eprintln!("  dns:");
    eprintln!("    listen: \"0.0.0.0:53\"");
    eprintln!("    strategy: forward            # or iterative");
    eprintln!("    upstream: \"1.1.1.1:53\"");
    eprintln!("    cache:");
    eprintln!("      backup_file: \"dns_cache.json\"");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} --listen 127.0.0.1:5353                  # Forward to 1.1.1.1", program);
    eprintln!("  {} --listen 127.0.0.1:5353 --iterative      # Walk from the roots", program);
    eprintln!("  {} --config config.yaml                      # Use config file", program);
    eprintln!();
    eprintln!("Client usage:");
    eprintln!("  dig @127.0.0.1 -p 5353 example.com A");
}
