//! Command line entry point.
//!
//! Usage:
//! ```text
//! layerproxy --config proxy.json
//! layerproxy --port 8080 --reverse tcp://127.0.0.1:8000
//! layerproxy --port 8080 --transparent
//! ```

use std::path::PathBuf;

use layerproxy::connection::Address;
use layerproxy::logging;
use layerproxy::options::{ProxyMode, ReverseScheme};
use layerproxy::proxy::{run_server, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args()?;
    logging::init(Some(config.storage_path.as_path()))?;
    run_server(config).await
}

fn parse_reverse(target: &str) -> anyhow::Result<ProxyMode> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("expected scheme://host:port, got {target}"))?;
    let scheme = match scheme {
        "tcp" => ReverseScheme::Tcp,
        "tls" => ReverseScheme::Tls,
        "dns" => ReverseScheme::Dns,
        other => anyhow::bail!("unknown reverse scheme {other}"),
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing port in {target}"))?;
    let port = port.parse()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(ProxyMode::Reverse {
        scheme,
        address: Address::new(host, port),
        via: None,
    })
}

fn parse_args() -> anyhow::Result<ProxyConfig> {
    let mut args = std::env::args().skip(1);
    let mut config = ProxyConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    config = ProxyConfig::from_json_file(&PathBuf::from(path))?;
                }
            }
            "--bind" => {
                if let Some(bind) = args.next() {
                    config.bind_address = bind;
                }
            }
            "--port" => {
                if let Some(port) = args.next() {
                    config.port = port.parse()?;
                }
            }
            "--storage-path" => {
                if let Some(path) = args.next() {
                    config.storage_path = PathBuf::from(path);
                }
            }
            "--reverse" => {
                if let Some(target) = args.next() {
                    config.options.mode = parse_reverse(&target)?;
                }
            }
            "--transparent" => {
                config.options.mode = ProxyMode::Transparent { via: None };
            }
            "--udp" => config.udp = true,
            "--debug" => config.options.proxy_debug = true,
            "--help" | "-h" => {
                eprintln!("layerproxy");
                eprintln!();
                eprintln!("Usage: layerproxy [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config <FILE>          JSON config, other flags override it");
                eprintln!("  --bind <ADDR>            Bind address (default: 127.0.0.1)");
                eprintln!("  --port <PORT>            Listen port (default: 8080)");
                eprintln!("  --storage-path <PATH>    CA and log storage (default: ./layerproxy)");
                eprintln!("  --reverse <SCHEME://HOST:PORT>  Reverse proxy to a target (tcp, tls, dns)");
                eprintln!("  --transparent            Transparent mode");
                eprintln!("  --udp                    Also accept UDP clients");
                eprintln!("  --debug                  Trace the layer stack");
                eprintln!("  --help, -h               Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    Ok(config)
}
