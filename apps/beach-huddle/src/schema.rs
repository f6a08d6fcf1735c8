//! Data contracts shared by both participants through the document store.
//!
//! The JSON shapes match what a browser peer writes: descriptions are
//! `{"type", "sdp"}` and candidates use `RTCIceCandidate.toJSON()` keys.

use doc_store::Fields;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{SignalError, SignalResult};

pub const OFFER_FIELD: &str = "offer";
pub const ANSWER_FIELD: &str = "answer";
pub const OFFERER_CANDIDATES: &str = "offererCandidates";
pub const ANSWERER_CANDIDATES: &str = "answererCandidates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// The stored `{"type", "sdp"}` object.
    pub fn to_value(&self) -> Value {
        json!({ "type": self.kind.as_str(), "sdp": self.sdp })
    }
}

/// Opaque reachability datum. Carried between peers, never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidateBlob {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Which script a participant runs. Each role writes only its own candidate
/// collection and reads only the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }

    pub fn outbound_collection(self) -> &'static str {
        match self {
            Role::Initiator => OFFERER_CANDIDATES,
            Role::Responder => ANSWERER_CANDIDATES,
        }
    }

    pub fn inbound_collection(self) -> &'static str {
        match self {
            Role::Initiator => ANSWERER_CANDIDATES,
            Role::Responder => OFFERER_CANDIDATES,
        }
    }
}

/// The shared offer/answer pair for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
}

impl SessionRecord {
    /// Decode stored fields. Absent and `null` fields both mean "not set";
    /// a description stored under the wrong field is rejected.
    pub fn from_fields(fields: &Fields) -> SignalResult<Self> {
        Ok(Self {
            offer: description_field(fields, OFFER_FIELD, SdpType::Offer)?,
            answer: description_field(fields, ANSWER_FIELD, SdpType::Answer)?,
        })
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(OFFER_FIELD.to_string(), description_value(self.offer.as_ref()));
        fields.insert(ANSWER_FIELD.to_string(), description_value(self.answer.as_ref()));
        fields
    }
}

/// Single-field patch carrying one description.
pub fn description_patch(field: &str, description: &SessionDescription) -> Fields {
    let mut fields = Fields::new();
    fields.insert(field.to_string(), description_value(Some(description)));
    fields
}

fn description_value(description: Option<&SessionDescription>) -> Value {
    match description {
        Some(description) => description.to_value(),
        None => Value::Null,
    }
}

fn description_field(
    fields: &Fields,
    field: &str,
    expected: SdpType,
) -> SignalResult<Option<SessionDescription>> {
    let value = match fields.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value.clone(),
    };
    let description: SessionDescription = serde_json::from_value(value)
        .map_err(|err| SignalError::InvalidState(format!("malformed {field} field: {err}")))?;
    if description.kind != expected {
        return Err(SignalError::InvalidState(format!(
            "{field} field holds a {:?} description",
            description.kind
        )));
    }
    Ok(Some(description))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn descriptions_use_browser_shape() {
        let value = serde_json::to_value(SessionDescription::offer("v=0")).expect("encode");
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn stored_description_matches_serde_shape() {
        let answer = SessionDescription::answer("v=0\r\ns=-\r\n");
        let patch = description_patch(ANSWER_FIELD, &answer);
        assert_eq!(patch[ANSWER_FIELD], json!({"type": "answer", "sdp": "v=0\r\ns=-\r\n"}));
        assert_eq!(
            serde_json::to_value(&answer).expect("encode"),
            patch[ANSWER_FIELD]
        );
        let decoded = SessionRecord::from_fields(&patch).expect("decode");
        assert_eq!(decoded.answer, Some(answer));
    }

    #[test]
    fn candidates_use_browser_keys() {
        let blob: IceCandidateBlob = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .expect("decode");
        assert_eq!(blob.sdp_mid.as_deref(), Some("0"));
        assert_eq!(blob.sdp_mline_index, Some(0));
        assert_eq!(blob.username_fragment.as_deref(), Some("abcd"));

        let bare: IceCandidateBlob =
            serde_json::from_value(json!({"candidate": "candidate:2"})).expect("decode");
        assert_eq!(bare, IceCandidateBlob::new("candidate:2"));
    }

    #[test]
    fn absent_and_null_fields_are_unset() {
        let empty = SessionRecord::from_fields(&Fields::new()).expect("decode");
        assert_eq!(empty, SessionRecord::default());

        let nulls =
            SessionRecord::from_fields(&SessionRecord::default().to_fields()).expect("decode");
        assert_eq!(nulls, SessionRecord::default());
    }

    #[test]
    fn record_round_trips_through_fields() {
        let record = SessionRecord {
            offer: Some(SessionDescription::offer("v=0 offer")),
            answer: Some(SessionDescription::answer("v=0 answer")),
        };
        assert_eq!(SessionRecord::from_fields(&record.to_fields()).expect("decode"), record);
    }

    #[test]
    fn mismatched_description_type_is_rejected() {
        let err = SessionRecord::from_fields(&fields(json!({
            "answer": {"type": "offer", "sdp": "v=0"}
        })))
        .expect_err("offer stored as answer");
        assert!(matches!(err, SignalError::InvalidState(_)));
    }

    #[test]
    fn roles_use_opposite_collections() {
        assert_eq!(Role::Initiator.outbound_collection(), Role::Responder.inbound_collection());
        assert_eq!(Role::Responder.outbound_collection(), Role::Initiator.inbound_collection());
        assert_ne!(Role::Initiator.outbound_collection(), Role::Initiator.inbound_collection());
    }
}
