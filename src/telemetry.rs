//! Telemetry probe
//!
//! After warm-ups, ask the local Prometheus whether it scraped token
//! activity for this run. Strictly best-effort: the probe reports what it
//! saw and never fails the run.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const PROMETHEUS_URL: &str = "http://127.0.0.1:9090/api/v1/query";
const QUERY: &str = "increase(sglang:prompt_tokens_total[1m])";

/// Outcome of the post-run telemetry probe
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryProbe {
    pub prometheus_query: String,
    pub with_run_filter: String,
    pub sample_count: usize,
    pub ok: bool,
}

impl TelemetryProbe {
    /// The never-ran / nothing-seen placeholder recorded at run start
    pub fn pending(run_id: &str) -> Self {
        Self {
            prometheus_query: QUERY.to_string(),
            with_run_filter: run_filter(run_id),
            sample_count: 0,
            ok: false,
        }
    }
}

fn run_filter(run_id: &str) -> String {
    format!(
        "increase(sglang:prompt_tokens_total{{container_run=\"{}\"}}[1m])",
        run_id
    )
}

/// Query Prometheus for recent token increases under this run's label.
///
/// Blocking; callers on the async runtime wrap this in `spawn_blocking`.
pub fn probe(run_id: &str) -> TelemetryProbe {
    let mut result = TelemetryProbe::pending(run_id);

    let config = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(3)))
        .build();
    let agent: ureq::Agent = config.into();

    let response = agent
        .get(PROMETHEUS_URL)
        .query("query", &result.with_run_filter)
        .call();

    let Ok(mut response) = response else {
        return result;
    };
    let Ok(body) = response.body_mut().read_to_string() else {
        return result;
    };
    let Ok(data) = serde_json::from_str::<Value>(&body) else {
        return result;
    };

    if data["status"] != "success" {
        return result;
    }

    let samples = data["data"]["result"].as_array().cloned().unwrap_or_default();
    result.sample_count = samples.len();
    result.ok = samples.iter().any(|item| sample_value(item) > 0.0);
    result
}

/// An instant-vector sample is `{"value": [<ts>, "<number>"]}`
fn sample_value(item: &Value) -> f64 {
    item["value"]
        .as_array()
        .and_then(|pair| pair.get(1))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_probe_shape() {
        let probe = TelemetryProbe::pending("run-7");
        assert_eq!(probe.sample_count, 0);
        assert!(!probe.ok);
        assert!(probe.with_run_filter.contains("container_run=\"run-7\""));
    }

    #[test]
    fn sample_value_parses_vector_pairs() {
        let item = serde_json::json!({"value": [1700000000.0, "3.5"]});
        assert_eq!(sample_value(&item), 3.5);

        let zero = serde_json::json!({"value": [1700000000.0, "0"]});
        assert_eq!(sample_value(&zero), 0.0);

        let malformed = serde_json::json!({"value": "nope"});
        assert_eq!(sample_value(&malformed), 0.0);
    }

    #[test]
    fn probe_without_prometheus_is_quiet() {
        // No Prometheus on 127.0.0.1:9090 in the test environment: the
        // probe must degrade to the pending shape, not error.
        let result = probe("run-nope");
        assert!(!result.ok);
    }
}
