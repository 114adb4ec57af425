//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    engine_state: Option<String>,
    #[serde(default)]
    active_partitions: Option<i64>,
    #[serde(default)]
    uptime_secs: Option<u64>,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    // Fetch health status
    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => {
                    print_health_status(&health, status_code.as_u16());
                }
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the t2t engine running?");
            println!("Start it with: t2t run --config <path-to-config>");
            return Ok(());
        }
    }

    // Fetch metrics
    let metrics_url = url
        .replace(":8080", ":9090")
        .replace("/health", "")
        .trim_end_matches('/')
        .to_string()
        + "/metrics";

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    let status_emoji = match health.status.as_str() {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    };

    println!(
        "{} Overall Status: {} (HTTP {})",
        status_emoji,
        health.status.to_uppercase(),
        status_code
    );
    if let Some(state) = &health.engine_state {
        println!("     Engine State:   {}", state);
    }
    if let Some(active) = health.active_partitions {
        println!("     Partitions:     {}", active);
    }
    if let Some(uptime) = health.uptime_secs {
        println!("     Uptime:         {}s", uptime);
    }
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let emoji = match status.status.as_str() {
                "healthy" => "[OK]",
                "degraded" => "[WARN]",
                "unhealthy" => "[FAIL]",
                _ => "[?]",
            };

            if let Some(msg) = &status.message {
                println!("  {} {}: {} ({})", emoji, name, status.status, msg);
            } else {
                println!("  {} {}: {}", emoji, name, status.status);
            }
        }
    }
}

/// Values scraped from the engine's Prometheus text.
#[derive(Debug, Default, PartialEq)]
struct MetricsSummary {
    counters: BTreeMap<String, u64>,
    errors_by_kind: BTreeMap<String, u64>,
    lag_by_partition: BTreeMap<i32, i64>,
}

impl MetricsSummary {
    fn parse(metrics_text: &str) -> Self {
        let mut summary = Self::default();

        for line in metrics_text.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }

            let Some((series, value)) = line.rsplit_once(' ') else {
                continue;
            };

            if let Some(kind) = label(series, "t2t_errors", "kind") {
                if let Ok(v) = value.parse() {
                    summary.errors_by_kind.insert(kind.to_string(), v);
                }
            } else if let Some(partition) = label(series, "t2t_partition_lag", "partition") {
                if let (Ok(p), Ok(v)) = (partition.parse(), value.parse()) {
                    summary.lag_by_partition.insert(p, v);
                }
            } else if let Some(name) = series.strip_prefix("t2t_") {
                if let Ok(v) = value.parse() {
                    summary.counters.insert(name.to_string(), v);
                }
            }
        }

        summary
    }

    fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.errors_by_kind.is_empty()
    }
}

/// Value of `key` in `name{key="value"}`.
fn label<'a>(series: &'a str, name: &str, key: &str) -> Option<&'a str> {
    let labels = series.strip_prefix(name)?.strip_prefix('{')?.strip_suffix('}')?;
    labels
        .strip_prefix(key)?
        .strip_prefix("=\"")?
        .strip_suffix('"')
}

fn print_metrics(metrics_text: &str) {
    let summary = MetricsSummary::parse(metrics_text);
    if summary.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    if let Some(v) = summary.counter("records_in_total") {
        println!("Records In:        {}", format_number(v));
    }
    if let Some(v) = summary.counter("records_out_total") {
        println!("Records Out:       {}", format_number(v));
    }
    if let Some(v) = summary.counter("records_skipped_total") {
        println!("Records Skipped:   {}", format_number(v));
    }
    if let Some(v) = summary.counter("commits_total") {
        println!("Commits:           {}", format_number(v));
    }
    if let Some(v) = summary.counter("publish_retries_total") {
        println!("Publish Retries:   {}", v);
    }
    if let Some(v) = summary.counter("partition_failures_total") {
        println!("Failed Partitions: {}", v);
    }

    let errors: u64 = summary.errors_by_kind.values().sum();
    println!("Errors:            {}", errors);
    for (kind, count) in summary.errors_by_kind.iter().filter(|(_, c)| **c > 0) {
        println!("  {}: {}", kind, count);
    }

    if !summary.lag_by_partition.is_empty() {
        println!("Lag:");
        for (partition, lag) in &summary.lag_by_partition {
            println!("  partition {}: {}", partition, lag);
        }
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# HELP t2t_records_in_total Records pulled from the source
# TYPE t2t_records_in_total counter
t2t_records_in_total 1200

t2t_records_out_total 1180
t2t_errors{kind=\"publish\"} 2
t2t_errors{kind=\"transform\"} 0
t2t_partition_lag{partition=\"0\"} 15
t2t_partition_lag{partition=\"3\"} 0
t2t_batch_duration_seconds_sum 0.42
";

    #[test]
    fn test_parse_metrics_summary() {
        let summary = MetricsSummary::parse(SAMPLE);

        assert_eq!(summary.counter("records_in_total"), Some(1200));
        assert_eq!(summary.counter("records_out_total"), Some(1180));
        assert_eq!(summary.errors_by_kind.get("publish"), Some(&2));
        assert_eq!(summary.errors_by_kind.get("transform"), Some(&0));
        assert_eq!(summary.lag_by_partition.get(&0), Some(&15));
        assert_eq!(summary.lag_by_partition.get(&3), Some(&0));
        // Non-integer samples are ignored.
        assert_eq!(summary.counter("batch_duration_seconds_sum"), None);
    }

    #[test]
    fn test_label_extraction() {
        assert_eq!(
            label("t2t_errors{kind=\"config\"}", "t2t_errors", "kind"),
            Some("config")
        );
        assert_eq!(label("t2t_errors_total", "t2t_errors", "kind"), None);
        assert_eq!(
            label("t2t_partition_lag{partition=\"7\"}", "t2t_errors", "kind"),
            None
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }
}
