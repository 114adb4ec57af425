//! Run command implementation.

use crate::server::{start_server, ServerState};
use crate::ExitCode;
use anyhow::Result;
use clap::Args;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use t2t_core::{Config, StreamEngine};
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Flags overriding values from the config file.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Override broker bootstrap servers (comma-separated)
    #[arg(long)]
    pub brokers: Option<String>,

    /// Override input topic
    #[arg(long)]
    pub input_topic: Option<String>,

    /// Override output topic
    #[arg(long)]
    pub output_topic: Option<String>,

    /// Override consumer group
    #[arg(long)]
    pub group_id: Option<String>,

    /// Override maximum records per pulled batch
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Override initial retry backoff in milliseconds
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Override retry budget for transient failures
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(brokers) = self.brokers {
            config.broker.bootstrap_servers = brokers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = self.input_topic {
            config.stream.input_topic = topic;
        }
        if let Some(topic) = self.output_topic {
            config.stream.output_topic = topic;
        }
        if let Some(group) = self.group_id {
            config.stream.group_id = group;
        }
        if let Some(size) = self.max_batch_size {
            config.stream.max_batch_size = size;
        }
        if let Some(backoff) = self.retry_backoff_ms {
            config.retry.retry_backoff_ms = backoff;
            // Keep the ceiling valid when only the base is raised.
            config.retry.max_backoff_ms = config.retry.max_backoff_ms.max(backoff);
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
    }
}

/// Run the stream engine until a signal or a fatal error.
pub async fn run(mut config: Config, args: RunArgs) -> Result<ExitCode> {
    args.apply(&mut config);
    config.validate()?;

    info!(
        input_topic = %config.stream.input_topic,
        output_topic = %config.stream.output_topic,
        group = %config.stream.group_id,
        transform = ?config.stream.transform,
        "Starting stream engine"
    );

    let health_port = config.monitoring.health_port;
    let metrics_port = config.monitoring.metrics_port;

    let engine = StreamEngine::from_config(&config)?;
    let handle = engine.shutdown_handle();

    let server_state = Arc::new(ServerState {
        health: engine.health(),
        metrics: engine.metrics(),
        engine_state: engine.state(),
    });
    let server_handle = handle.clone();
    tokio::spawn(start_server(
        server_state,
        health_port,
        metrics_port,
        async move { server_handle.requested().await },
    ));

    // SIGINT and SIGTERM both drain; only SIGINT changes the exit code.
    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_handle = handle.clone();
    let signal_flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), draining");
                    signal_flag.store(true, Ordering::SeqCst);
                    signal_handle.shutdown();
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), draining");
                    signal_flag.store(true, Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, draining");
                }
                _ = signal_handle.requested() => return,
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, draining");
                    signal_flag.store(true, Ordering::SeqCst);
                }
                _ = signal_handle.requested() => return,
            }
        }

        signal_handle.shutdown();
    });

    let result = engine.run().await;
    // Stop the HTTP servers and the signal task on every exit path.
    handle.shutdown();

    let report = result?;
    info!(
        records_in = report.records_in(),
        records_out = report.records_out(),
        records_skipped = report.records_skipped(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Stream engine stopped"
    );

    for outcome in report.failures() {
        error!(
            partition = outcome.partition,
            committed = ?outcome.committed,
            error = ?outcome.error.as_ref().map(|e| e.to_string()),
            "Partition stopped on a fatal error"
        );
    }

    // Isolated partition failures still fail the process once the rest drained.
    if let Some(error) = report.partitions.into_values().find_map(|o| o.error) {
        return Err(error.into());
    }

    if interrupted.load(Ordering::SeqCst) {
        Ok(ExitCode::SignalInterrupt)
    } else {
        Ok(ExitCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str(
            r#"
            [broker]
            bootstrap_servers = ["localhost:9092"]

            [stream]
            input_topic = "in"
            output_topic = "out"
            group_id = "g"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = base_config();
        RunArgs {
            brokers: Some("a:9092, b:9092,".into()),
            output_topic: Some("derived".into()),
            max_batch_size: Some(64),
            max_retries: Some(2),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.broker.bootstrap_servers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.stream.input_topic, "in");
        assert_eq!(config.stream.output_topic, "derived");
        assert_eq!(config.stream.max_batch_size, 64);
        assert_eq!(config.retry.max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_override_keeps_ceiling_valid() {
        let mut config = base_config();
        RunArgs {
            retry_backoff_ms: Some(60_000),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.retry.retry_backoff_ms, 60_000);
        assert_eq!(config.retry.max_backoff_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_override_rejected_before_start() {
        let config = base_config();
        let err = run(
            config,
            RunArgs {
                output_topic: Some("in".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);
    }
}
