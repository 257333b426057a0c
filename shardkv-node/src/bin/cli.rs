//! shardkv line client
//!
//! Reads commands from stdin and prints each response.
//!
//! ```text
//! SET <key> <value>
//! GET <key>
//! REMOVE <key>
//! LIST
//! PING
//! NODES <addr>[,<addr>...]
//! ```

use std::io::{self, BufRead, Write};

use clap::Parser;
use shardkv_core::{Request, RpcClient, TransportConfig, CLIENT_PATH};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Interactive client for a shardkv node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

/// Turn one input line into a request
fn parse_command(line: &str) -> Result<Request, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().ok_or("empty command")?.to_uppercase();
    let arg1 = parts.next();
    let rest: Vec<&str> = parts.collect();

    match (command.as_str(), arg1) {
        ("GET", Some(key)) => Ok(Request::get(key)),
        ("SET", Some(key)) if !rest.is_empty() => Ok(Request::set(key, rest.join(" "))),
        ("REMOVE", Some(key)) => Ok(Request::remove(key)),
        ("LIST", None) => Ok(Request::list()),
        ("PING", None) => Ok(Request::ping()),
        ("NODES", Some(addrs)) => {
            let addrs: Vec<String> = addrs.split(',').map(String::from).collect();
            Request::nodes(&addrs).map_err(|e| e.to_string())
        }
        _ => Err(format!("cannot parse '{}'", line.trim())),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = RpcClient::connect(&args.addr, CLIENT_PATH, &TransportConfig::default()).await?;

    println!("Connected to {}", args.addr);
    println!("Commands: SET <k> <v> | GET <k> | REMOVE <k> | LIST | PING | NODES <a,b>");

    // Blocking stdin read on a dedicated thread, handed over line by line
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        if matches!(line.trim(), "quit" | "exit") {
            break;
        }

        let request = match parse_command(&line) {
            Ok(r) => r,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match client.send_sync(&request).await {
            Ok(resp) if resp.success => println!("ok {}", resp.result),
            Ok(resp) => println!("error {}", resp.error),
            Err(e) => println!("failed: {}", e),
        }
        io::stdout().flush()?;
    }

    client.close().await;
    Ok(())
}
