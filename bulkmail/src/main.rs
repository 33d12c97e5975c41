//! Bulk-email orchestration daemon entrypoint: loads configuration, wires
//! the scheduler to the standard campaign handler, and serves until a
//! shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use bulkmail::handler::CampaignHandler;
use bulkmail_common::config::{Config, LoggingConfig, SafetyLimits, SmtpConfig};
use bulkmail_common::Signal;
use bulkmail_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceManager, RetryPolicy};
use bulkmail_scheduler::{AutoShutdown, SchedulerManager};
use tracing::info;

/// Configuration is read from the environment: an env var per `SmtpConfig`
/// field, with the same defaults `Config`'s own `serde(default)`s carry.
/// A richer file/CLI config loader can be layered on top of this later
/// without touching the rest of the daemon.
fn config_from_env() -> Config {
    let smtp = SmtpConfig {
        host: std::env::var("BULKMAIL_SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("BULKMAIL_SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok()),
        username: std::env::var("BULKMAIL_SMTP_USER").unwrap_or_default(),
        password: std::env::var("BULKMAIL_SMTP_PASSWORD").unwrap_or_default(),
        from: std::env::var("BULKMAIL_SMTP_FROM").unwrap_or_else(|_| "bulkmail@localhost".to_string()),
        use_tls: std::env::var("BULKMAIL_SMTP_TLS").is_ok(),
        insecure_skip_verify: false,
        connection_timeout_secs: 10,
        read_timeout_secs: 30,
        write_timeout_secs: 30,
    };

    Config {
        smtp,
        logging: LoggingConfig {
            level: std::env::var("BULKMAIL_LOG").unwrap_or_else(|_| "info".to_string()),
            json: std::env::var("BULKMAIL_LOG_JSON").is_ok(),
        },
        limits: SafetyLimits::default(),
    }
}

fn default_resilience() -> Arc<ResilienceManager> {
    Arc::new(ResilienceManager::new(
        CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 5,
            timeout: Duration::from_secs(30),
        }),
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        },
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config_from_env();
    config.validate()?;
    bulkmail_common::logging::init(&config.logging);

    info!(host = %config.smtp.host, "bulkmail starting");

    let store_path = std::env::var("BULKMAIL_STORE_PATH").unwrap_or_else(|_| "bulkmail-store".to_string());
    let manager = Arc::new(SchedulerManager::new(
        store_path,
        Some(default_resilience()),
        None::<AutoShutdown>,
    ));

    let scheduler = manager.scheduler()?;
    scheduler.reattach_handlers(CampaignHandler::default_handler(manager.signal_sender()));

    tokio::spawn(shutdown_on_ctrl_c(manager.signal_sender()));
    manager.run_daemon().await?;

    info!("bulkmail shut down");
    Ok(())
}

async fn shutdown_on_ctrl_c(signal_tx: tokio::sync::broadcast::Sender<Signal>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("ctrl-c received, shutting down");
    let _ = signal_tx.send(Signal::Shutdown);
}
