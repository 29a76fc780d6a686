use crate::error::{AppError, Result};
use crate::host::{
    EntityState, HistoryBatch, HistorySample, HistorySource, LiveStateSource, LiveStates,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the host's REST API (`/api/states`, `/api/history/period`).
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("power-tree/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl LiveStateSource for RestClient {
    async fn fetch_states(&self) -> Result<LiveStates> {
        let states: Vec<EntityState> = self
            .get("/api/states")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(count = states.len(), "fetched live states");
        Ok(states.into_iter().collect())
    }
}

impl HistorySource for RestClient {
    async fn fetch_history(
        &self,
        entity_ids: &BTreeSet<String>,
        start: f64,
        end: f64,
    ) -> Result<HistoryBatch> {
        if entity_ids.is_empty() {
            return Ok(HistoryBatch::new());
        }

        let start = epoch_to_datetime(start)?;
        let end = epoch_to_datetime(end)?;
        let filter = entity_ids.iter().cloned().collect::<Vec<_>>().join(",");

        let body: Value = self
            .get(&format!("/api/history/period/{}", start.to_rfc3339()))
            .query(&[
                ("filter_entity_id", filter.as_str()),
                ("end_time", end.to_rfc3339().as_str()),
                ("minimal_response", ""),
                ("no_attributes", ""),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let batch = decode_history(body)?;
        debug!(
            entities = batch.len(),
            samples = batch.values().map(Vec::len).sum::<usize>(),
            "fetched history"
        );
        Ok(batch)
    }
}

#[derive(Debug, Deserialize)]
struct PeriodEntry {
    #[serde(default)]
    entity_id: Option<String>,
    state: String,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    last_changed: Option<String>,
}

/// Minimal encoding: `{"s": state, "lu": epoch seconds}`.
#[derive(Debug, Deserialize)]
struct CompressedEntry {
    s: String,
    lu: f64,
}

/// Decode either the period form (array of per-entity arrays, entity id on the
/// first entry only) or the minimal form (object keyed by entity id).
pub fn decode_history(body: Value) -> Result<HistoryBatch> {
    match body {
        Value::Object(_) => {
            let compressed: HashMap<String, Vec<CompressedEntry>> = serde_json::from_value(body)?;
            Ok(compressed
                .into_iter()
                .map(|(entity_id, entries)| {
                    let samples = entries
                        .into_iter()
                        .map(|e| HistorySample::new(e.s, e.lu))
                        .collect();
                    (entity_id, samples)
                })
                .collect())
        }
        Value::Array(_) => {
            let series: Vec<Vec<PeriodEntry>> = serde_json::from_value(body)?;
            let mut batch = HistoryBatch::new();
            for entries in series {
                let Some(entity_id) = entries.first().and_then(|e| e.entity_id.clone()) else {
                    continue;
                };
                let mut samples = Vec::with_capacity(entries.len());
                for entry in entries {
                    let stamp = entry.last_updated.or(entry.last_changed);
                    match stamp.as_deref().map(parse_timestamp) {
                        Some(Ok(ts)) => samples.push(HistorySample::new(entry.state, ts)),
                        Some(Err(e)) => {
                            warn!(entity = %entity_id, error = %e, "skipping history entry")
                        }
                        None => warn!(entity = %entity_id, "history entry without timestamp"),
                    }
                }
                batch.entry(entity_id).or_default().extend(samples);
            }
            Ok(batch)
        }
        other => Err(AppError::Host(format!(
            "unexpected history payload: {}",
            other
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Result<f64> {
    let ts = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| AppError::Time(format!("{}: {}", raw, e)))?;
    Ok(ts.timestamp_millis() as f64 / 1_000.0)
}

fn epoch_to_datetime(epoch: f64) -> Result<DateTime<Utc>> {
    let millis = (epoch * 1_000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AppError::Time(format!("timestamp out of range: {}", epoch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_compressed_history() {
        let body = json!({
            "sensor.a": [{"s": "10", "lu": 1000.0}, {"s": "20", "lu": 1005.5}],
            "sensor.b": []
        });

        let batch = decode_history(body).unwrap();
        assert_eq!(
            batch["sensor.a"],
            vec![
                HistorySample::new("10", 1000.0),
                HistorySample::new("20", 1005.5)
            ]
        );
        assert!(batch["sensor.b"].is_empty());
    }

    #[test]
    fn test_decode_period_history() {
        let body = json!([
            [
                {"entity_id": "sensor.a", "state": "5", "last_changed": "1970-01-01T00:16:40+00:00"},
                {"state": "unavailable", "last_changed": "1970-01-01T00:16:50.500+00:00"},
                {"state": "7", "last_changed": "not a time"}
            ],
            []
        ]);

        let batch = decode_history(body).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch["sensor.a"],
            vec![
                HistorySample::new("5", 1000.0),
                HistorySample::new("unavailable", 1010.5)
            ]
        );
    }

    #[test]
    fn test_decode_rejects_scalar() {
        assert!(decode_history(json!("nope")).is_err());
    }

    #[test]
    fn test_epoch_round_trip() {
        let dt = epoch_to_datetime(1_700_000_000.25).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_250);
    }
}
