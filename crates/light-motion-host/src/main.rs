//! Light Motion - motion-activated lighting host

use device_registry::{InMemoryRegistry, InProcessBus};
use light_motion::persistence::load_rules;
use light_motion::LightMotionRule;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "light_motion=info,device_registry=info,info".into()),
        )
        .init();

    tracing::info!("Starting Light Motion");

    let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    tracing::info!("Using data directory {:?}", data_dir);

    let registry = Arc::new(InMemoryRegistry::open(data_dir.join("devices.json")).await);
    tracing::info!("Registry holds {} devices", registry.devices().len());
    let bus = Arc::new(InProcessBus::default());

    let mut rules = Vec::new();
    for config in load_rules(&data_dir.join("rules.json")).await {
        let id = config.id.clone();
        match LightMotionRule::start(config, registry.clone(), bus.clone()) {
            Ok(rule) => {
                tracing::info!("Rule {} controlled by {}", rule.id(), rule.device_id());
                rules.push(rule);
            }
            Err(e) => tracing::error!("Failed to start rule {}: {}", id, e),
        }
    }
    tracing::info!("Running {} rules", rules.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    // Rules keep their persisted state and resume on the next start
    drop(rules);
    registry.flush().await?;

    Ok(())
}
