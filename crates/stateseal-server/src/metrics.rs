//! Request counters exposed on the monitoring listener's `/metrics`.
//!
//! Counters are plain atomics over fixed label sets and are rendered in the
//! Prometheus text format by hand. Status codes are bucketed by class
//! (`2xx`, `4xx`, ...). Backend calls are labelled by the client's verb, not
//! the remapped one sent upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::{Method, StatusCode};
use stateseal_core::{KeyObserver, KeyOperation, ProviderKind};

const METHODS: [&str; 5] = ["GET", "POST", "LOCK", "UNLOCK", "other"];
const STATUS_CLASSES: [&str; 5] = ["1xx", "2xx", "3xx", "4xx", "5xx"];
/// Status classes plus `error` for calls that got no response.
const BACKEND_OUTCOMES: [&str; 6] = ["1xx", "2xx", "3xx", "4xx", "5xx", "error"];
const REQUESTS: [&str; 2] = ["encrypt", "decrypt"];
const PROBES: [&str; 2] = ["liveness", "readiness"];
const PROVIDERS: [ProviderKind; 2] = [ProviderKind::Local, ProviderKind::Transit];
const OPERATIONS: [KeyOperation; 2] = [KeyOperation::Wrap, KeyOperation::Unwrap];

/// Which transform a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Encrypt,
    Decrypt,
}

/// Which monitoring probe was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Liveness,
    Readiness,
}

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    proxy_requests: [[AtomicU64; 5]; 5],
    transform_ok: [AtomicU64; 2],
    transform_error: [AtomicU64; 2],
    transform_micros: [AtomicU64; 2],
    probe_requests: [[AtomicU64; 5]; 2],
    backend_requests: [[AtomicU64; 6]; 5],
    backend_micros: [AtomicU64; 5],
    key_ok: [[AtomicU64; 2]; 2],
    key_error: [[AtomicU64; 2]; 2],
    key_micros: [[AtomicU64; 2]; 2],
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

#[allow(clippy::cast_precision_loss)]
fn seconds(micros: &AtomicU64) -> f64 {
    micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
}

fn provider_index(provider: ProviderKind) -> usize {
    match provider {
        ProviderKind::Local => 0,
        ProviderKind::Transit => 1,
    }
}

fn operation_index(operation: KeyOperation) -> usize {
    match operation {
        KeyOperation::Wrap => 0,
        KeyOperation::Unwrap => 1,
    }
}

fn method_index(method: &Method) -> usize {
    match method.as_str() {
        "GET" => 0,
        "POST" => 1,
        "LOCK" => 2,
        "UNLOCK" => 3,
        _ => 4,
    }
}

fn status_index(status: StatusCode) -> usize {
    usize::from(status.as_u16() / 100)
        .saturating_sub(1)
        .min(STATUS_CLASSES.len() - 1)
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request answered by the proxy, keyed by the client's method.
    pub fn record_request(&self, method: &Method, status: StatusCode) {
        self.proxy_requests[method_index(method)][status_index(status)]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a transform and its duration.
    pub fn record_transform(&self, kind: TransformKind, ok: bool, elapsed: Duration) {
        let i = kind as usize;
        let outcome = if ok {
            &self.transform_ok[i]
        } else {
            &self.transform_error[i]
        };
        outcome.fetch_add(1, Ordering::Relaxed);
        self.transform_micros[i].fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    /// Count a backend call made for a client request. `status` is `None`
    /// when the backend could not be reached.
    pub fn record_backend(&self, method: &Method, status: Option<StatusCode>, elapsed: Duration) {
        let m = method_index(method);
        let outcome = status.map_or(BACKEND_OUTCOMES.len() - 1, status_index);
        self.backend_requests[m][outcome].fetch_add(1, Ordering::Relaxed);
        self.backend_micros[m].fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_probe(&self, probe: Probe, status: StatusCode) {
        self.probe_requests[probe as usize][status_index(status)].fetch_add(1, Ordering::Relaxed);
    }

    /// Render every counter in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(64);

        lines.push("# HELP stateseal_proxy_requests_total Requests answered by the proxy.".to_owned());
        lines.push("# TYPE stateseal_proxy_requests_total counter".to_owned());
        for (m, row) in self.proxy_requests.iter().enumerate() {
            for (s, counter) in row.iter().enumerate() {
                let n = counter.load(Ordering::Relaxed);
                if n > 0 {
                    lines.push(format!(
                        "stateseal_proxy_requests_total{{method=\"{}\",status=\"{}\"}} {n}",
                        METHODS[m], STATUS_CLASSES[s]
                    ));
                }
            }
        }

        lines.push(
            "# HELP stateseal_transform_requests_total Document transforms by outcome.".to_owned(),
        );
        lines.push("# TYPE stateseal_transform_requests_total counter".to_owned());
        for (i, request) in REQUESTS.iter().enumerate() {
            for (outcome, counters) in [("ok", &self.transform_ok), ("error", &self.transform_error)]
            {
                lines.push(format!(
                    "stateseal_transform_requests_total{{request=\"{request}\",outcome=\"{outcome}\"}} {}",
                    counters[i].load(Ordering::Relaxed)
                ));
            }
        }

        lines.push(
            "# HELP stateseal_transform_duration_seconds Time spent transforming documents."
                .to_owned(),
        );
        lines.push("# TYPE stateseal_transform_duration_seconds summary".to_owned());
        for (i, request) in REQUESTS.iter().enumerate() {
            let count = self.transform_ok[i].load(Ordering::Relaxed)
                + self.transform_error[i].load(Ordering::Relaxed);
            lines.push(format!(
                "stateseal_transform_duration_seconds_sum{{request=\"{request}\"}} {}",
                seconds(&self.transform_micros[i])
            ));
            lines.push(format!(
                "stateseal_transform_duration_seconds_count{{request=\"{request}\"}} {count}"
            ));
        }

        lines.push(
            "# HELP stateseal_backend_requests_total Calls to the state backend by outcome."
                .to_owned(),
        );
        lines.push("# TYPE stateseal_backend_requests_total counter".to_owned());
        for (m, row) in self.backend_requests.iter().enumerate() {
            for (o, counter) in row.iter().enumerate() {
                let n = counter.load(Ordering::Relaxed);
                if n > 0 {
                    lines.push(format!(
                        "stateseal_backend_requests_total{{method=\"{}\",status=\"{}\"}} {n}",
                        METHODS[m], BACKEND_OUTCOMES[o]
                    ));
                }
            }
        }

        lines.push(
            "# HELP stateseal_backend_duration_seconds Time spent waiting on the state backend."
                .to_owned(),
        );
        lines.push("# TYPE stateseal_backend_duration_seconds summary".to_owned());
        for (m, row) in self.backend_requests.iter().enumerate() {
            let count: u64 = row.iter().map(|c| c.load(Ordering::Relaxed)).sum();
            if count > 0 {
                lines.push(format!(
                    "stateseal_backend_duration_seconds_sum{{method=\"{}\"}} {}",
                    METHODS[m],
                    seconds(&self.backend_micros[m])
                ));
                lines.push(format!(
                    "stateseal_backend_duration_seconds_count{{method=\"{}\"}} {count}",
                    METHODS[m]
                ));
            }
        }

        lines.push(
            "# HELP stateseal_key_provider_requests_total Data key wraps and unwraps by provider."
                .to_owned(),
        );
        lines.push("# TYPE stateseal_key_provider_requests_total counter".to_owned());
        for provider in PROVIDERS {
            let p = provider_index(provider);
            for operation in OPERATIONS {
                let o = operation_index(operation);
                for (outcome, counters) in [("ok", &self.key_ok), ("error", &self.key_error)] {
                    lines.push(format!(
                        "stateseal_key_provider_requests_total{{provider=\"{}\",operation=\"{}\",outcome=\"{outcome}\"}} {}",
                        provider.name(),
                        operation.name(),
                        counters[p][o].load(Ordering::Relaxed)
                    ));
                }
            }
        }

        lines.push(
            "# HELP stateseal_key_provider_duration_seconds Time spent in key provider calls."
                .to_owned(),
        );
        lines.push("# TYPE stateseal_key_provider_duration_seconds summary".to_owned());
        for provider in PROVIDERS {
            let p = provider_index(provider);
            for operation in OPERATIONS {
                let o = operation_index(operation);
                let count = self.key_ok[p][o].load(Ordering::Relaxed)
                    + self.key_error[p][o].load(Ordering::Relaxed);
                let labels = format!(
                    "provider=\"{}\",operation=\"{}\"",
                    provider.name(),
                    operation.name()
                );
                lines.push(format!(
                    "stateseal_key_provider_duration_seconds_sum{{{labels}}} {}",
                    seconds(&self.key_micros[p][o])
                ));
                lines.push(format!(
                    "stateseal_key_provider_duration_seconds_count{{{labels}}} {count}"
                ));
            }
        }

        lines.push("# HELP stateseal_probe_requests_total Monitoring probes served.".to_owned());
        lines.push("# TYPE stateseal_probe_requests_total counter".to_owned());
        for (p, row) in self.probe_requests.iter().enumerate() {
            for (s, counter) in row.iter().enumerate() {
                let n = counter.load(Ordering::Relaxed);
                if n > 0 {
                    lines.push(format!(
                        "stateseal_probe_requests_total{{probe=\"{}\",status=\"{}\"}} {n}",
                        PROBES[p], STATUS_CLASSES[s]
                    ));
                }
            }
        }

        lines.push("# HELP stateseal_info stateseal build information.".to_owned());
        lines.push("# TYPE stateseal_info gauge".to_owned());
        lines.push(format!(
            "stateseal_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        ));

        lines.join("\n") + "\n"
    }
}

impl KeyObserver for Metrics {
    fn key_operation(
        &self,
        provider: ProviderKind,
        operation: KeyOperation,
        ok: bool,
        elapsed: Duration,
    ) {
        let (p, o) = (provider_index(provider), operation_index(operation));
        let outcome = if ok { &self.key_ok } else { &self.key_error };
        outcome[p][o].fetch_add(1, Ordering::Relaxed);
        self.key_micros[p][o].fetch_add(micros(elapsed), Ordering::Relaxed);
    }
}
