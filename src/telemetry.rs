//! Telemetry forwarding
//!
//! Each stats tick is forwarded best-effort to an external collector.
//! Submission runs on its own task; failures are logged (throttled) and
//! never reach the session.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TelemetryConfig;
use crate::error::{AppError, Result};
use crate::quality::{ConnectionQuality, HealthScore, NetworkMetrics};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// One sample as submitted to the collector
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub session_id: String,
    pub participant_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub metrics: NetworkMetrics,
    pub health_score: u8,
    pub quality: ConnectionQuality,
}

impl TelemetryRecord {
    pub fn new(session_id: &str, participant_id: &str, metrics: NetworkMetrics, health: HealthScore) -> Self {
        Self {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            timestamp: chrono::Utc::now(),
            metrics,
            health_score: health.score,
            quality: health.quality,
        }
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn submit(&self, record: &TelemetryRecord) -> Result<()>;
}

/// POSTs records as JSON to a collector endpoint
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetrySink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Telemetry(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn submit(&self, record: &TelemetryRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| AppError::Telemetry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::Telemetry(format!(
                "Collector returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes records to the debug log; used when no endpoint is configured
pub struct LogTelemetrySink;

#[async_trait]
impl TelemetrySink for LogTelemetrySink {
    async fn submit(&self, record: &TelemetryRecord) -> Result<()> {
        debug!(
            session_id = %record.session_id,
            score = record.health_score,
            quality = %record.quality,
            loss = record.metrics.packet_loss,
            rtt_ms = record.metrics.rtt_ms,
            "Telemetry sample"
        );
        Ok(())
    }
}

/// Fire-and-forget front for a sink
#[derive(Clone)]
pub struct TelemetryDispatcher {
    sink: Arc<dyn TelemetrySink>,
    throttler: Arc<LogThrottler>,
}

impl TelemetryDispatcher {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            throttler: Arc::new(LogThrottler::default()),
        }
    }

    /// HTTP sink when an endpoint is configured, log sink otherwise
    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        let sink: Arc<dyn TelemetrySink> = match config.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => {
                info!("Forwarding telemetry to {}", endpoint);
                Arc::new(HttpTelemetrySink::new(
                    endpoint,
                    Duration::from_secs(config.timeout_secs.max(1)),
                )?)
            }
            _ => Arc::new(LogTelemetrySink),
        };
        Ok(Self::new(sink))
    }

    /// Submit without waiting; errors are logged and dropped
    pub fn dispatch(&self, record: TelemetryRecord) {
        let sink = self.sink.clone();
        let throttler = self.throttler.clone();
        tokio::spawn(async move {
            match sink.submit(&record).await {
                Ok(()) => throttler.clear("telemetry_submit"),
                Err(e) => {
                    warn_throttled!(throttler, "telemetry_submit", "Telemetry submission failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        records: Mutex<Vec<TelemetryRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn submit(&self, record: &TelemetryRecord) -> Result<()> {
            self.records.lock().push(record.clone());
            if self.fail {
                Err(AppError::Telemetry("collector down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn record() -> TelemetryRecord {
        let metrics = NetworkMetrics {
            packet_loss: 0.5,
            rtt_ms: 40.0,
            jitter_ms: 8.0,
            ..Default::default()
        };
        TelemetryRecord::new("S1", "teacher-1", metrics, crate::quality::health::score(&metrics))
    }

    #[test]
    fn test_record_shape() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["sessionId"], "S1");
        assert_eq!(value["participantId"], "teacher-1");
        assert_eq!(value["packetLoss"], 0.5);
        assert_eq!(value["quality"], "excellent");
        assert!(value.get("healthScore").is_some());
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            records: Mutex::new(Vec::new()),
            fail: true,
        });
        let dispatcher = TelemetryDispatcher::new(sink.clone());

        dispatcher.dispatch(record());
        dispatcher.dispatch(record());

        for _ in 0..50 {
            if sink.records.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.records.lock().len(), 2);
    }

    #[test]
    fn test_empty_endpoint_uses_log_sink() {
        let config = TelemetryConfig {
            endpoint: Some(String::new()),
            timeout_secs: 5,
        };
        assert!(TelemetryDispatcher::from_config(&config).is_ok());
    }
}
