//! Control protocol: wire format and typed messages
//!
//! The wire shape is fixed for compatibility: `{ "Cmd": <int>, "Params": {...}
//! }`, one JSON object per line. Internally, messages are decoded straight
//! into a tagged-union `ControlMessage` with one payload variant per action;
//! nothing downstream of [`decode`] ever touches the untyped params map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;

/// The closed set of control-socket actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Action {
    Add = 1,
    Remove = 2,
    Watch = 3,
    WatchAll = 4,
    Stop = 5,
    StopAll = 6,
    Code = 7,
    ConnectionError = 8,
}

impl Action {
    fn from_code(code: i64) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Self::Add),
            2 => Ok(Self::Remove),
            3 => Ok(Self::Watch),
            4 => Ok(Self::WatchAll),
            5 => Ok(Self::Stop),
            6 => Ok(Self::StopAll),
            7 => Ok(Self::Code),
            8 => Ok(Self::ConnectionError),
            other => Err(ProtocolError::UnknownAction(other)),
        }
    }
}

/// A single control message, independent of any session state.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Register a new mailbox in the registry.
    Add {
        email: String,
        password: String,
        server: String,
        port: u16,
        use_ssl: bool,
    },
    /// Remove a mailbox from the registry.
    Remove { email: String },
    /// Start watching a single mailbox.
    Watch { email: String },
    /// Start watching every registered mailbox.
    WatchAll,
    /// Stop watching a single mailbox.
    Stop { email: String },
    /// Stop watching every active mailbox.
    StopAll,
    /// Server→client: a code was extracted.
    Code { code: String, sender: String },
    /// Server→client: a watcher terminated abnormally.
    ConnectionError { email: String, error: String },
}

impl ControlMessage {
    fn action(&self) -> Action {
        match self {
            Self::Add { .. } => Action::Add,
            Self::Remove { .. } => Action::Remove,
            Self::Watch { .. } => Action::Watch,
            Self::WatchAll => Action::WatchAll,
            Self::Stop { .. } => Action::Stop,
            Self::StopAll => Action::StopAll,
            Self::Code { .. } => Action::Code,
            Self::ConnectionError { .. } => Action::ConnectionError,
        }
    }
}

/// Raw wire shape: `{ "Cmd": <int>, "Params": { ... } }`.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "Cmd")]
    cmd: i64,
    #[serde(rename = "Params")]
    #[serde(default)]
    params: Map<String, Value>,
}

/// Encode a [`ControlMessage`] as a single JSON line (no trailing newline;
/// the caller's framing codec adds it).
pub fn encode(message: &ControlMessage) -> String {
    let mut params = Map::new();
    match message {
        ControlMessage::Add {
            email,
            password,
            server,
            port,
            use_ssl,
        } => {
            params.insert("email".into(), Value::String(email.clone()));
            params.insert("password".into(), Value::String(password.clone()));
            params.insert("server".into(), Value::String(server.clone()));
            params.insert("port".into(), Value::Number((*port).into()));
            params.insert("useSSL".into(), Value::Bool(*use_ssl));
        }
        ControlMessage::Remove { email } | ControlMessage::Watch { email } | ControlMessage::Stop { email } => {
            params.insert("email".into(), Value::String(email.clone()));
        }
        ControlMessage::WatchAll | ControlMessage::StopAll => {}
        ControlMessage::Code { code, sender } => {
            params.insert("code".into(), Value::String(code.clone()));
            params.insert("sender".into(), Value::String(sender.clone()));
        }
        ControlMessage::ConnectionError { email, error } => {
            params.insert("email".into(), Value::String(email.clone()));
            params.insert("error".into(), Value::String(error.clone()));
        }
    }

    let wire = WireMessage {
        cmd: message.action() as i64,
        params,
    };

    serde_json::to_string(&wire).expect("ControlMessage always serializes")
}

/// Decode a single JSON line into a [`ControlMessage`].
///
/// Unknown action codes and missing/mistyped required parameters are
/// rejected; the caller (the control server's reader task) drops the
/// message and keeps the connection open.
pub fn decode(line: &str) -> Result<ControlMessage, ProtocolError> {
    let wire: WireMessage = serde_json::from_str(line)?;
    let action = Action::from_code(wire.cmd)?;
    let params = wire.params;

    let message = match action {
        Action::Add => ControlMessage::Add {
            email: string_param(&params, "email")?,
            password: string_param(&params, "password")?,
            server: string_param(&params, "server")?,
            port: u16_param(&params, "port")?,
            use_ssl: bool_param(&params, "useSSL")?,
        },
        Action::Remove => ControlMessage::Remove {
            email: string_param(&params, "email")?,
        },
        Action::Watch => ControlMessage::Watch {
            email: string_param(&params, "email")?,
        },
        Action::WatchAll => ControlMessage::WatchAll,
        Action::Stop => ControlMessage::Stop {
            email: string_param(&params, "email")?,
        },
        Action::StopAll => ControlMessage::StopAll,
        Action::Code => ControlMessage::Code {
            code: string_param(&params, "code")?,
            sender: string_param(&params, "sender")?,
        },
        Action::ConnectionError => ControlMessage::ConnectionError {
            email: string_param(&params, "email")?,
            error: string_param(&params, "error")?,
        },
    };

    Ok(message)
}

fn string_param(params: &Map<String, Value>, name: &str) -> Result<String, ProtocolError> {
    params
        .get(name)
        .ok_or_else(|| ProtocolError::MissingParam(name.to_owned()))?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::WrongParamType {
            name: name.to_owned(),
            expected: "string".to_owned(),
        })
}

fn bool_param(params: &Map<String, Value>, name: &str) -> Result<bool, ProtocolError> {
    params
        .get(name)
        .ok_or_else(|| ProtocolError::MissingParam(name.to_owned()))?
        .as_bool()
        .ok_or_else(|| ProtocolError::WrongParamType {
            name: name.to_owned(),
            expected: "bool".to_owned(),
        })
}

fn u16_param(params: &Map<String, Value>, name: &str) -> Result<u16, ProtocolError> {
    let value = params
        .get(name)
        .ok_or_else(|| ProtocolError::MissingParam(name.to_owned()))?
        .as_u64()
        .ok_or_else(|| ProtocolError::WrongParamType {
            name: name.to_owned(),
            expected: "u16".to_owned(),
        })?;

    u16::try_from(value).map_err(|_| ProtocolError::WrongParamType {
        name: name.to_owned(),
        expected: "u16".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: ControlMessage) {
        let encoded = encode(&message);
        let decoded = decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, message);
    }

    #[test]
    fn round_trips_every_action() {
        round_trip(ControlMessage::Add {
            email: "a@example.com".into(),
            password: "secret".into(),
            server: "imap.example.com".into(),
            port: 993,
            use_ssl: true,
        });
        round_trip(ControlMessage::Remove {
            email: "a@example.com".into(),
        });
        round_trip(ControlMessage::Watch {
            email: "a@example.com".into(),
        });
        round_trip(ControlMessage::WatchAll);
        round_trip(ControlMessage::Stop {
            email: "a@example.com".into(),
        });
        round_trip(ControlMessage::StopAll);
        round_trip(ControlMessage::Code {
            code: "482913".into(),
            sender: "a@example.com".into(),
        });
        round_trip(ControlMessage::ConnectionError {
            email: "a@example.com".into(),
            error: "login failed".into(),
        });
    }

    #[test]
    fn decode_rejects_action_outside_closed_set() {
        let err = decode(r#"{"Cmd":99,"Params":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(99)));
    }

    #[test]
    fn decode_rejects_missing_required_param() {
        let err = decode(r#"{"Cmd":2,"Params":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingParam(_)));
    }

    #[test]
    fn decode_rejects_wrong_param_type() {
        let err = decode(r#"{"Cmd":2,"Params":{"email":42}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongParamType { .. }));
    }

    #[test]
    fn wire_shape_matches_documented_format() {
        let encoded = encode(&ControlMessage::Code {
            code: "123456".into(),
            sender: "a@example.com".into(),
        });
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["Cmd"], 7);
        assert_eq!(value["Params"]["code"], "123456");
        assert_eq!(value["Params"]["sender"], "a@example.com");
    }

    #[test]
    fn encoding_is_stable_for_byte_comparison() {
        let message = ControlMessage::StopAll;
        assert_eq!(encode(&message), encode(&message));
    }
}
