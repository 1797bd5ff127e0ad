//! Message taxonomy exchanged between the relay, the execution context and
//! the browser. Every variant is a JSON object tagged by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A single widget property changed. The browser runtime sends the
    /// dashed spelling, which is accepted on input.
    #[serde(rename = "widget_update", alias = "widget-update")]
    WidgetUpdate(WidgetUpdate),
    #[serde(rename = "init-config")]
    InitConfig(InitConfig),
    #[serde(rename = "error")]
    Error(AppError),
    #[serde(rename = "get_state")]
    GetState,
    #[serde(rename = "get_widget_states")]
    GetWidgetStates { client_id: String },
    /// Sent to a websocket whose session no longer exists.
    #[serde(rename = "session-error")]
    SessionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetUpdate {
    pub widget_id: String,
    pub property: String,
    pub value: Value,
    /// Connection the change originated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub widgets: Vec<String>,
    pub widget_configs: BTreeMap<String, WidgetConfig>,
    pub template: String,
    /// Set when the config answers a single connection's handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Browser-facing description of one widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    #[serde(rename = "moduleUrl")]
    pub module_url: String,
    pub defaults: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl Message {
    pub fn widget_update(
        widget_id: impl Into<String>,
        property: impl Into<String>,
        value: Value,
    ) -> Self {
        Message::WidgetUpdate(WidgetUpdate {
            widget_id: widget_id.into(),
            property: property.into(),
            value,
            client_id: None,
        })
    }

    pub fn error(
        error_type: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Message::Error(AppError {
            error_type: error_type.into(),
            message: message.into(),
            traceback: traceback.into(),
        })
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::WidgetUpdate(_) => "widget_update",
            Message::InitConfig(_) => "init-config",
            Message::Error(_) => "error",
            Message::GetState => "get_state",
            Message::GetWidgetStates { .. } => "get_widget_states",
            Message::SessionError => "session-error",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(msg: &Message) -> Message {
        let text = msg.encode().unwrap();
        Message::decode(&text).unwrap()
    }

    #[test]
    fn test_every_variant_round_trips() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "counter".to_string(),
            WidgetConfig {
                module_url: "export default { render };".to_string(),
                defaults: BTreeMap::from([("value".to_string(), json!(2))]),
            },
        );
        let messages = vec![
            Message::widget_update("counter", "value", json!(3.5)),
            Message::WidgetUpdate(WidgetUpdate {
                widget_id: "toggle".to_string(),
                property: "visible".to_string(),
                value: json!(false),
                client_id: Some("c1".to_string()),
            }),
            Message::InitConfig(InitConfig {
                widgets: vec!["counter".to_string()],
                widget_configs: configs,
                template: "index.html.j2".to_string(),
                client_id: None,
            }),
            Message::error("ValueError", "boom", "line 1"),
            Message::GetState,
            Message::GetWidgetStates {
                client_id: "c2".to_string(),
            },
            Message::SessionError,
        ];
        for msg in &messages {
            assert_eq!(&round_trip(msg), msg);
        }
    }

    #[test]
    fn test_numeric_array_serializes_as_plain_array() {
        let values: Vec<i64> = vec![1, 2, 3];
        let msg = Message::widget_update("chart", "series", serde_json::to_value(&values).unwrap());
        let text = msg.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["value"], json!([1, 2, 3]));
        assert_eq!(round_trip(&msg), msg);

        let floats: Vec<f64> = vec![0.5, -1.25];
        let msg = Message::widget_update("chart", "weights", serde_json::to_value(&floats).unwrap());
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_wire_type_tags() {
        let text = Message::GetState.encode().unwrap();
        assert_eq!(text, r#"{"type":"get_state"}"#);

        let text = Message::widget_update("a", "b", json!(1)).encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["type"], "widget_update");
        assert!(raw.get("client_id").is_none());

        let raw: Value =
            serde_json::from_str(&Message::error("E", "m", "t").encode().unwrap()).unwrap();
        assert_eq!(raw["type"], "error");
        assert_eq!(raw["traceback"], "t");
    }

    #[test]
    fn test_decode_accepts_dashed_widget_update() {
        let msg = Message::decode(
            r#"{"type":"widget-update","widget_id":"counter","property":"value","value":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(msg, Message::widget_update("counter", "value", json!([1, 2])));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Message::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }
}
