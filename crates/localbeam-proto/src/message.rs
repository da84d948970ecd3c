use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ClientId;

/// Kinds of frames carried over the signaling socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Register,
    Offer,
    Answer,
    Candidate,
    PeerList,
    /// Anything this build does not understand; kept so the relay can log and
    /// drop it instead of failing the parse.
    #[serde(other)]
    Unknown,
}

impl SignalKind {
    /// Negotiation kinds are forwarded by the relay to `targetId`.
    pub fn is_negotiation(self) -> bool {
        matches!(self, SignalKind::Offer | SignalKind::Answer | SignalKind::Candidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Register => "register",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::PeerList => "peer-list",
            SignalKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single signaling frame. All fields are top level on the wire and
/// `payload` is never interpreted by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<ClientId>>,
}

/// Errors raised while decoding or validating a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} message missing 'clientId'")]
    MissingClientId(SignalKind),
    #[error("{0} message missing 'targetId'")]
    MissingTargetId(SignalKind),
    #[error("unknown message type")]
    UnknownType,
}

/// What the relay should do with a validated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Register {
        client_id: &'a str,
    },
    Relay {
        kind: SignalKind,
        client_id: &'a str,
        target_id: &'a str,
    },
    PeerList,
}

impl SignalMessage {
    fn bare(kind: SignalKind) -> Self {
        Self {
            kind,
            client_id: None,
            target_id: None,
            payload: None,
            peers: None,
        }
    }

    pub fn register(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::bare(SignalKind::Register)
        }
    }

    /// Builds an offer, answer or candidate addressed to `target_id`.
    pub fn negotiation(
        kind: SignalKind,
        client_id: impl Into<ClientId>,
        target_id: impl Into<ClientId>,
        payload: Value,
    ) -> Self {
        debug_assert!(kind.is_negotiation());
        Self {
            client_id: Some(client_id.into()),
            target_id: Some(target_id.into()),
            payload: Some(payload),
            ..Self::bare(kind)
        }
    }

    pub fn offer(from: impl Into<ClientId>, to: impl Into<ClientId>, payload: Value) -> Self {
        Self::negotiation(SignalKind::Offer, from, to, payload)
    }

    pub fn answer(from: impl Into<ClientId>, to: impl Into<ClientId>, payload: Value) -> Self {
        Self::negotiation(SignalKind::Answer, from, to, payload)
    }

    pub fn candidate(from: impl Into<ClientId>, to: impl Into<ClientId>, payload: Value) -> Self {
        Self::negotiation(SignalKind::Candidate, from, to, payload)
    }

    pub fn peer_list(peers: Vec<ClientId>) -> Self {
        Self {
            peers: Some(peers),
            ..Self::bare(SignalKind::PeerList)
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks the fields required by this frame's kind.
    pub fn route(&self) -> Result<Route<'_>, ProtocolError> {
        match self.kind {
            SignalKind::Register => {
                let client_id = self
                    .client_id
                    .as_deref()
                    .ok_or(ProtocolError::MissingClientId(self.kind))?;
                Ok(Route::Register { client_id })
            }
            SignalKind::Offer | SignalKind::Answer | SignalKind::Candidate => {
                let client_id = self
                    .client_id
                    .as_deref()
                    .ok_or(ProtocolError::MissingClientId(self.kind))?;
                let target_id = self
                    .target_id
                    .as_deref()
                    .ok_or(ProtocolError::MissingTargetId(self.kind))?;
                Ok(Route::Relay {
                    kind: self.kind,
                    client_id,
                    target_id,
                })
            }
            SignalKind::PeerList => Ok(Route::PeerList),
            SignalKind::Unknown => Err(ProtocolError::UnknownType),
        }
    }

    /// Copy delivered to the recipient: sender and payload only, the target
    /// is implied by the socket it arrives on.
    pub fn forwarded(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            payload: self.payload.clone(),
            ..Self::bare(self.kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_offer_with_camel_case_fields() {
        let msg = SignalMessage::parse(
            r#"{"type":"offer","clientId":"A","targetId":"B","payload":{"sdp":"x"}}"#,
        )
        .expect("parse");
        assert_eq!(msg.kind, SignalKind::Offer);
        assert_eq!(
            msg.route().expect("route"),
            Route::Relay {
                kind: SignalKind::Offer,
                client_id: "A",
                target_id: "B"
            }
        );
    }

    #[test]
    fn unknown_type_parses_but_does_not_route() {
        let msg = SignalMessage::parse(r#"{"type":"bye","clientId":"A"}"#).expect("parse");
        assert_eq!(msg.kind, SignalKind::Unknown);
        assert!(matches!(msg.route(), Err(ProtocolError::UnknownType)));
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(
            SignalMessage::parse(r#"{"clientId":"A"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SignalMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn negotiation_requires_both_ids() {
        let msg = SignalMessage::parse(r#"{"type":"candidate","clientId":"A"}"#).unwrap();
        assert!(matches!(
            msg.route(),
            Err(ProtocolError::MissingTargetId(SignalKind::Candidate))
        ));
        let msg = SignalMessage::parse(r#"{"type":"register"}"#).unwrap();
        assert!(matches!(
            msg.route(),
            Err(ProtocolError::MissingClientId(SignalKind::Register))
        ));
    }

    #[test]
    fn forwarded_copy_strips_target() {
        let msg = SignalMessage::answer("A", "B", json!({"sdp": "v=0"}));
        let wire: Value = serde_json::from_str(&msg.forwarded().to_json().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"type": "answer", "clientId": "A", "payload": {"sdp": "v=0"}})
        );
    }

    #[test]
    fn peer_list_serializes_kebab_case() {
        let wire = SignalMessage::peer_list(vec!["A".into()]).to_json().unwrap();
        assert_eq!(wire, r#"{"type":"peer-list","peers":["A"]}"#);
    }
}
