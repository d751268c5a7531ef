// ABOUTME: WebSocket wire protocol for terminal attachment: closed tagged
// unions in both directions

use serde::{Deserialize, Serialize};

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Raw terminal bytes, UTF-8 encoded (lossily for partial sequences).
    Output { data: String },
    /// Terminal error; the connection closes right after.
    Error { message: String },
    /// Ask the client to report its size with a `resize`.
    RequestResize,
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Keystrokes for the pty's stdin.
    Input { data: String },
    /// Terminal dimensions for the exec pty.
    Resize { cols: u16, rows: u16 },
}

impl ServerMessage {
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn server_messages_use_the_wire_tags() {
        assert_eq!(
            ServerMessage::output("hi").to_json(),
            r#"{"type":"output","data":"hi"}"#
        );
        assert_eq!(
            ServerMessage::error("boom").to_json(),
            r#"{"type":"error","message":"boom"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::RequestResize).unwrap(),
            r#"{"type":"request-resize"}"#
        );
    }

    #[test]
    fn client_messages_parse_from_the_wire() {
        let input: ClientMessage =
            serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            input,
            ClientMessage::Input {
                data: "ls\n".to_string()
            }
        );
        let resize: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(resize, ClientMessage::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn unknown_client_message_types_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"signal","signal":"SIGINT"}"#)
            .is_err());
    }
}
