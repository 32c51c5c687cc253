//! Prometheus metrics for workflow engine monitoring.
//!
//! This module provides Prometheus metrics exposition for the workflow
//! engine: command throughput by outcome, state-transition counts, and
//! command latency distributions. All metrics use labels for drill-down by
//! command and transition edge.

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, HistogramVec, Opts, Registry};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for the workflow engine.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct GreenlightMetrics {
    registry: Registry,

    // Counters (cumulative totals)
    commands_total: CounterVec,
    state_transitions_total: CounterVec,

    // Histograms (distributions)
    command_duration_seconds: HistogramVec,
}

#[cfg(feature = "metrics")]
impl GreenlightMetrics {
    /// Create a new GreenlightMetrics instance with the given registry.
    ///
    /// Registers all metrics with the provided Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let commands_total = CounterVec::new(
            Opts::new(
                "greenlight_commands_total",
                "Total number of commands dispatched, by command and outcome",
            ),
            &["command", "outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create commands_total counter: {}", e))?;

        let state_transitions_total = CounterVec::new(
            Opts::new(
                "greenlight_state_transitions_total",
                "Total number of committed request state transitions",
            ),
            &["from", "to"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create state_transitions_total counter: {}", e))?;

        let command_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "greenlight_command_duration_seconds",
                "Command processing duration in seconds",
            ),
            &["command"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create command_duration histogram: {}", e))?;

        registry
            .register(Box::new(commands_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register commands_total: {}", e))?;
        registry
            .register(Box::new(state_transitions_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register state_transitions_total: {}", e))?;
        registry
            .register(Box::new(command_duration_seconds.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register command_duration_seconds: {}", e))?;

        Ok(Self {
            registry,
            commands_total,
            state_transitions_total,
            command_duration_seconds,
        })
    }

    /// Record one dispatched command with its outcome and latency.
    pub fn observe_command(&self, command: &str, outcome: &str, duration: Duration) {
        self.commands_total
            .with_label_values(&[command, outcome])
            .inc();
        self.command_duration_seconds
            .with_label_values(&[command])
            .observe(duration.as_secs_f64());
    }

    /// Record one committed state transition.
    pub fn record_transition(&self, from: &str, to: &str) {
        self.state_transitions_total
            .with_label_values(&[from, to])
            .inc();
    }

    /// The registry all metrics are registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
