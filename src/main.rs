//! `idempotency-inspect`: reads a JSON payload on stdin, derives its
//! idempotency key with the configured settings and reports the stored
//! record. With `--purge` it removes expired records instead.

use anyhow::Context;
use lambda_idempotency::clock::{Clock, SystemClock};
use lambda_idempotency::config::Settings;
use lambda_idempotency::idempotency::{DerivedKey, IdempotencyKeyGenerator};
use lambda_idempotency::observability::{init_logging, init_metrics, mask_url_credentials, LogConfig};
use lambda_idempotency::persistence;
use serde_json::{json, Value};
use std::io::Read;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::new().context("failed to load configuration")?;
    init_logging(&LogConfig::from_settings(&settings.logging)).context("failed to initialize logging")?;
    init_metrics().context("failed to install metrics recorder")?;
    info!(function_name = %settings.function_name, "Configuration loaded");

    if let Some(url) = &settings.persistence.url {
        info!("Connecting to {:?} store at {}...", settings.persistence.backend, mask_url_credentials(url));
    }
    let store = persistence::connect(&settings)
        .await
        .context("failed to connect to persistence store")?;
    info!("Persistence store ready");

    let clock = SystemClock;

    if std::env::args().skip(1).any(|arg| arg == "--purge") {
        let removed = store.purge_expired(clock.now()).await?;
        info!(removed, "Purged expired idempotency records");
        println!("{}", json!({ "purged": removed }));
        return Ok(());
    }

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read payload from stdin")?;
    let payload: Value = serde_json::from_str(&input).context("payload is not valid JSON")?;

    let generator = IdempotencyKeyGenerator::new(settings.function_name.clone(), &settings.idempotency)?;
    let report = match generator.derive(&payload)? {
        DerivedKey::Bypass => json!({ "idempotency_key": null, "bypassed": true }),
        DerivedKey::Key {
            idempotency_key,
            payload_hash,
        } => {
            let record = store.get(&idempotency_key).await?;
            let effective_status = record
                .as_ref()
                .map(|r| r.effective_status(clock.now()).to_string());

            json!({
                "idempotency_key": idempotency_key,
                "payload_hash": payload_hash,
                "effective_status": effective_status,
                "record": record,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
