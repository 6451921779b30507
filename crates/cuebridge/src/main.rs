use std::process;
use std::sync::Arc;

use anyhow::Context;
use cuebridge::config::USAGE;
use cuebridge::{Bridge, BridgeConfig, BridgeError, ConfigError, Engine, LoopbackEngine};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match BridgeConfig::from_args(&args) {
        Ok(config) => config,
        Err(ConfigError::Help) => {
            println!("{USAGE}");
            return;
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    cuebridge::logging::init_tracing();
    tracing::info!(version = cuebridge::BRIDGE_VERSION, transport = %config.transport, "Using protocol");

    if let Err(e) = run(config).await {
        tracing::error!(error = ?e, "Bridge exited with error");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let store = config.store.clone();
    let bridge = Bridge::new(config);

    let result = bridge
        .run(move |events| {
            let engine = LoopbackEngine::new(events);
            let engine = match store {
                Some(dir) => engine.with_store(dir)?,
                None => engine,
            };
            Ok(Arc::new(engine) as Arc<dyn Engine>)
        })
        .await;

    match result {
        Ok(exit) => {
            tracing::debug!(?exit, "Pump finished");
            Ok(())
        }
        Err(e @ BridgeError::Boot { .. }) => Err(e).context("bridge failed to boot"),
        Err(e) => Err(e.into()),
    }
}
