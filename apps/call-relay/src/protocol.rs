//! Wire messages exchanged between browsers and the relay.
//!
//! Frames are JSON objects tagged by `"type"`. Session descriptions and
//! network candidates travel as [`Payload`], which keeps the exact JSON
//! text the sender produced so it can be re-emitted untouched.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier a client registers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifiers must carry at least one visible character.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Handle for one live transport session, minted by the transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Negotiation body the relay never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.to_owned()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Messages sent from a browser to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register {
        user_id: UserId,
    },
    Call {
        from: UserId,
        to: UserId,
        offer: Payload,
    },
    Answer {
        to: UserId,
        answer: Payload,
    },
    IceCandidate {
        to: UserId,
        candidate: Payload,
    },
    EndCall {
        to: UserId,
    },
}

/// Messages sent from the relay to a browser
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    IncomingCall { from: UserId, offer: Payload },
    CallAnswered { answer: Payload },
    IceCandidate { candidate: Payload },
    EndCall,
    CallError { reason: String },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::IncomingCall { .. } => "incoming-call",
            ServerMessage::CallAnswered { .. } => "call-answered",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::EndCall => "end-call",
            ServerMessage::CallError { .. } => "call-error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` message: {source}")]
    Fields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: std::borrow::Cow<'a, str>,
}

#[derive(Deserialize)]
struct RegisterFrame {
    #[serde(rename = "userId")]
    user_id: UserId,
}

#[derive(Deserialize)]
struct CallFrame {
    from: UserId,
    to: UserId,
    offer: Payload,
}

#[derive(Deserialize)]
struct AnswerFrame {
    to: UserId,
    answer: Payload,
}

#[derive(Deserialize)]
struct CandidateFrame {
    to: UserId,
    candidate: Payload,
}

#[derive(Deserialize)]
struct EndCallFrame {
    to: UserId,
}

impl ClientMessage {
    /// Decode a text frame. The tag is read first and the frame is then
    /// parsed into the matching variant, so opaque bodies stay raw.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope<'_> = serde_json::from_str(text).map_err(DecodeError::Json)?;
        match envelope.kind.as_ref() {
            "register" => {
                let frame: RegisterFrame = fields("register", text)?;
                Ok(ClientMessage::Register {
                    user_id: frame.user_id,
                })
            }
            "call" => {
                let frame: CallFrame = fields("call", text)?;
                Ok(ClientMessage::Call {
                    from: frame.from,
                    to: frame.to,
                    offer: frame.offer,
                })
            }
            "answer" => {
                let frame: AnswerFrame = fields("answer", text)?;
                Ok(ClientMessage::Answer {
                    to: frame.to,
                    answer: frame.answer,
                })
            }
            "ice-candidate" => {
                let frame: CandidateFrame = fields("ice-candidate", text)?;
                Ok(ClientMessage::IceCandidate {
                    to: frame.to,
                    candidate: frame.candidate,
                })
            }
            "end-call" => {
                let frame: EndCallFrame = fields("end-call", text)?;
                Ok(ClientMessage::EndCall { to: frame.to })
            }
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Call { .. } => "call",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::EndCall { .. } => "end-call",
        }
    }
}

fn fields<'de, T: Deserialize<'de>>(kind: &'static str, text: &'de str) -> Result<T, DecodeError> {
    serde_json::from_str(text).map_err(|source| DecodeError::Fields { kind, source })
}
