use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON text frame exchanged with the notification hub.
///
/// Client → hub: `invocation`. Hub → client: `completion` (acknowledges an
/// invocation by id) and `event` (server push). Either side may send `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    Invocation {
        id: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Completion {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        target: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Ping,
}

impl HubFrame {
    /// Successful completion for invocation `id`.
    pub fn ack(id: impl Into<String>) -> Self {
        HubFrame::Completion {
            id: id.into(),
            result: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_wire_format() {
        let frame = HubFrame::Invocation {
            id: "1".to_string(),
            method: "JoinMonitorGroup".to_string(),
            args: vec![json!(42)],
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "invocation", "id": "1", "method": "JoinMonitorGroup", "args": [42]})
        );
    }

    #[test]
    fn test_ack_omits_empty_fields() {
        assert_eq!(
            serde_json::to_value(HubFrame::ack("9")).unwrap(),
            json!({"type": "completion", "id": "9"})
        );
    }

    #[test]
    fn test_parse_event_and_error_completion() {
        let frame: HubFrame = serde_json::from_str(
            r#"{"type":"event","target":"ReceiveNotification","args":[{"id":"n1"}]}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            HubFrame::Event {
                target: "ReceiveNotification".to_string(),
                args: vec![json!({"id": "n1"})],
            }
        );

        let frame: HubFrame =
            serde_json::from_str(r#"{"type":"completion","id":"3","error":"no such group"}"#).unwrap();
        assert_eq!(
            frame,
            HubFrame::Completion {
                id: "3".to_string(),
                result: None,
                error: Some("no such group".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<HubFrame>(r#"{"type":"bogus"}"#).is_err());
    }
}
