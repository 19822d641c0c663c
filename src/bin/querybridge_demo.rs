//! querybridge demo
//!
//! Runs a query and a live subscription against the in-memory engine across
//! an in-process boundary and prints every payload the bridge delivers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::info;

use querybridge::{in_process, BridgeConfig, BridgeResult, FetchRequest, InMemoryEngine, Resolved};

const GREETING: &str = "query Greeting { greeting }";
const TICKS: &str = "subscription Ticks { tick }";

/// Demo configuration
struct Config {
    /// Log filter directive
    log_level: String,
    /// Number of payloads to publish into the subscription
    publish: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            publish: 3,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--log-level" | "-l" => {
                if i + 1 < args.len() {
                    config.log_level = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("error: --log-level requires a value");
                    std::process::exit(1);
                }
            }
            "--publish" | "-n" => {
                if i + 1 < args.len() {
                    config.publish = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("error: invalid publish count: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("error: --publish requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("querybridge-demo - Streaming query bridge demo");
                println!();
                println!("USAGE:");
                println!("    querybridge-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -l, --log-level <FILTER>  Log filter directive [default: info]");
                println!("    -n, --publish <N>         Payloads to publish into the subscription [default: 3]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                eprintln!("Run with --help for usage information");
                std::process::exit(1);
            }
        }
    }

    config
}

fn main() {
    let config = parse_args();
    if let Err(e) = querybridge::logging::init(&config.log_level) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = run(&config) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> BridgeResult<()> {
    let engine = Arc::new(InMemoryEngine::new());
    engine.define(GREETING, vec![Resolved::Data(json!({ "greeting": "hello" }))])?;
    engine.define(TICKS, vec![Resolved::Data(json!({ "tick": 0 }))])?;

    let (bridge, host) = in_process(engine.clone(), BridgeConfig::default())?;
    bridge.start_service()?;

    // One-shot query, consumed as an iterator.
    if let Some(id) = bridge.parse_query(GREETING)? {
        for payload in bridge.fetch_stream(FetchRequest::new(id).operation_name("Greeting"))? {
            println!("query {id}: {payload}");
        }
        bridge.discard_query(id)?;
    }

    // Live subscription, fed by publish and ended by unsubscribe.
    if let Some(id) = bridge.parse_query(TICKS)? {
        let mut stream = bridge.fetch_stream(FetchRequest::new(id).operation_name("Ticks"))?;
        if let Some(first) = stream.recv_timeout(Duration::from_secs(5))? {
            println!("subscription {id}: {first}");
        }

        wait_for_stream(&engine)?;
        for tick in 1..=config.publish {
            engine.publish(id, &Resolved::Data(json!({ "tick": tick })))?;
        }

        stream.unsubscribe();
        while let Some(payload) = stream.recv_timeout(Duration::from_secs(5))? {
            println!("subscription {id}: {payload}");
        }
        info!(%id, "subscription ended");
    }

    bridge.on_all_contexts_closed()?;
    drop(bridge);
    host.join()
}

fn wait_for_stream(engine: &InMemoryEngine) -> BridgeResult<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.live_streams()? == 0 {
        if Instant::now() >= deadline {
            return Err(querybridge::BridgeError::internal("subscription never went live"));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}
