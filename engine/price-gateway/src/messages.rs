//! Message types for the price feed WebSocket API
//!
//! Requests use `{id, method, params}`; pushes and replies use
//! `{stream, data}` or `{id, result}` / `{id, error}`.

use chrono::{DateTime, Utc};
use pricing_engine::{OpportunityId, OpportunityPriceState, PriceSnapshot, PriceUpdateEvent, TickSeq};
use serde::{Deserialize, Serialize};

pub const METHOD_SUBSCRIBE: &str = "prices.subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "prices.unsubscribe";
pub const METHOD_SNAPSHOT: &str = "prices.snapshot";
pub const METHOD_PING: &str = "ping";

pub const STREAM_PRICE_UPDATE: &str = "price_update";
pub const STREAM_PRICE_BATCH: &str = "price_batch";
pub const STREAM_SNAPSHOT: &str = "snapshot";
pub const STREAM_PONG: &str = "pong";
pub const STREAM_ERROR: &str = "error";

/// Base message structure for all WebSocket messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Message ID for request/response correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Request method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Stream type of a pushed message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Result (for successful responses)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error (for error responses)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
}

impl Message {
    pub fn request(id: impl Into<String>, method: &str, params: Option<serde_json::Value>) -> Self {
        Self { id: Some(id.into()), method: Some(method.to_string()), params, ..Default::default() }
    }

    pub fn stream(stream: &str, data: serde_json::Value) -> Self {
        Self { stream: Some(stream.to_string()), data: Some(data), ..Default::default() }
    }

    pub fn response(id: Option<String>, result: serde_json::Value) -> Self {
        Self { id, result: Some(result), ..Default::default() }
    }

    pub fn error(id: Option<String>, code: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            stream: Some(STREAM_ERROR.to_string()),
            error: Some(ErrorMessage { code, message: message.into(), details: None }),
            ..Default::default()
        }
    }
}

/// Error message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code
    pub code: u32,

    /// Error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// `prices.subscribe` / `prices.unsubscribe` parameters.
/// No ids means every opportunity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    #[serde(default)]
    pub opportunity_ids: Option<Vec<OpportunityId>>,
}

/// One price change as pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub opportunity_id: OpportunityId,
    pub old_price: f64,
    pub new_price: f64,
    pub trend_sign: i8,
    pub timestamp: DateTime<Utc>,
    pub tick_seq: TickSeq,
}

impl From<&PriceUpdateEvent> for PriceUpdate {
    fn from(event: &PriceUpdateEvent) -> Self {
        Self {
            opportunity_id: event.opportunity_id,
            old_price: event.old_price,
            new_price: event.new_price,
            trend_sign: event.trend_sign,
            timestamp: event.timestamp,
            tick_seq: event.tick_seq,
        }
    }
}

/// Several price changes from one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBatchUpdate {
    pub tick_seq: TickSeq,
    pub updates: Vec<PriceUpdate>,
}

/// Price of one opportunity inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub opportunity_id: OpportunityId,
    pub outlet: String,
    pub current_price: f64,
    pub floor_price: f64,
    pub cutoff_price: f64,
    pub trend_sign: i8,
    pub last_price_update: DateTime<Utc>,
}

impl From<&OpportunityPriceState> for SnapshotEntry {
    fn from(state: &OpportunityPriceState) -> Self {
        Self {
            opportunity_id: state.opportunity_id,
            outlet: state.outlet.clone(),
            current_price: state.current_price,
            floor_price: state.floor_price,
            cutoff_price: state.cutoff_price,
            trend_sign: state.trend.sign(),
            last_price_update: state.last_price_update,
        }
    }
}

/// Full price state as of `tick_seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub tick_seq: TickSeq,
    pub taken_at: DateTime<Utc>,
    pub prices: Vec<SnapshotEntry>,
}

impl From<&PriceSnapshot> for SnapshotData {
    fn from(snapshot: &PriceSnapshot) -> Self {
        Self {
            tick_seq: snapshot.tick_seq,
            taken_at: snapshot.taken_at,
            prices: snapshot.prices.iter().map(SnapshotEntry::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let text = r#"{"id":"1","method":"prices.subscribe","params":{"opportunity_ids":[4,5]}}"#;
        let message: Message = serde_json::from_str(text).unwrap();
        assert_eq!(message.method.as_deref(), Some(METHOD_SUBSCRIBE));

        let params: SubscribeParams = serde_json::from_value(message.params.unwrap()).unwrap();
        assert_eq!(params.opportunity_ids, Some(vec![4, 5]));

        let empty: SubscribeParams = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.opportunity_ids, None);
    }

    #[test]
    fn test_stream_message_omits_empty_fields() {
        let message = Message::stream(STREAM_PONG, serde_json::json!({}));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, serde_json::json!({"stream": "pong", "data": {}}));
    }

    #[test]
    fn test_error_message() {
        let message = Message::error(Some("7".into()), 40400, "Unknown method: foo");
        assert_eq!(message.stream.as_deref(), Some(STREAM_ERROR));
        assert_eq!(message.error.unwrap().code, 40400);
    }
}
