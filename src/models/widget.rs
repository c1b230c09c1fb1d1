//! Host-boundary types for widget taps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// What the host hands over when a rendered widget is tapped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub entity_id: String,
    pub widget_instance_id: String,
    pub mutation_kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl MutationRequest {
    pub fn new(entity_id: &str, widget_instance_id: &str, mutation_kind: &str, payload: Value) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            widget_instance_id: widget_instance_id.to_string(),
            mutation_kind: mutation_kind.to_string(),
            payload,
        }
    }
}

/// Validated form of [`MutationRequest::mutation_kind`] + payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WidgetMutation {
    Increment { amount: f64 },
    Decrement { amount: f64 },
    Toggle,
    SetCompleted { value: bool },
    TimerStart,
    TimerPause,
    TimerStop,
    TimerComplete,
}

impl WidgetMutation {
    pub fn from_request(request: &MutationRequest) -> Result<Self, SyncError> {
        if request.entity_id.trim().is_empty() {
            return Err(SyncError::InvalidMutation("entityId is required".into()));
        }
        if request.widget_instance_id.trim().is_empty() {
            return Err(SyncError::InvalidMutation("widgetInstanceId is required".into()));
        }
        if !(request.payload.is_null() || request.payload.is_object()) {
            return Err(SyncError::InvalidMutation("payload must be an object".into()));
        }

        let mutation = match request.mutation_kind.as_str() {
            "increment" => WidgetMutation::Increment {
                amount: amount(&request.payload)?,
            },
            "decrement" => WidgetMutation::Decrement {
                amount: amount(&request.payload)?,
            },
            "toggle" => WidgetMutation::Toggle,
            "set_completed" => match request.payload.get("value").and_then(Value::as_bool) {
                Some(value) => WidgetMutation::SetCompleted { value },
                None => {
                    return Err(SyncError::InvalidMutation(
                        "set_completed requires a boolean value".into(),
                    ))
                }
            },
            "timer_start" => WidgetMutation::TimerStart,
            "timer_pause" => WidgetMutation::TimerPause,
            "timer_stop" => WidgetMutation::TimerStop,
            "timer_complete" => WidgetMutation::TimerComplete,
            other => {
                return Err(SyncError::InvalidMutation(format!(
                    "unknown mutation kind '{other}'"
                )))
            }
        };
        Ok(mutation)
    }

    pub fn is_timer(&self) -> bool {
        matches!(
            self,
            WidgetMutation::TimerStart
                | WidgetMutation::TimerPause
                | WidgetMutation::TimerStop
                | WidgetMutation::TimerComplete
        )
    }
}

fn amount(payload: &Value) -> Result<f64, SyncError> {
    match payload.get("amount") {
        None | Some(Value::Null) => Ok(1.0),
        Some(value) => match value.as_f64() {
            Some(amount) if amount.is_finite() && amount > 0.0 => Ok(amount),
            _ => Err(SyncError::InvalidMutation(
                "amount must be a positive number".into(),
            )),
        },
    }
}

/// Short text the host shows after a tap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub message: String,
    pub success: bool,
}

impl Acknowledgement {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
        }
    }
}
