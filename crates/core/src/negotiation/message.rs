//! Control-plane JSON messages.
//!
//! Every message is an envelope `{"type": ..., "payload": {...}}` where
//! `type` is `offer`, `answer` or `pli`. Field names are written in
//! camelCase; PascalCase is accepted on input.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VideoError};

pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_PLI: &str = "pli";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOffer {
    #[serde(alias = "Codec")]
    pub codec: String,
    #[serde(default, alias = "ProfileLevelId", alias = "profile", alias = "Profile")]
    pub profile_level_id: String,
    #[serde(alias = "Width")]
    pub width: u32,
    #[serde(alias = "Height")]
    pub height: u32,
    #[serde(alias = "Bitrate")]
    pub bitrate: u32,
    #[serde(default, alias = "SpropParameterSets")]
    pub sprop_parameter_sets: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnswer {
    #[serde(alias = "Accepted")]
    pub accepted: bool,
    #[serde(default, alias = "Codec")]
    pub codec: String,
    #[serde(default, alias = "ProfileLevelId", alias = "profile", alias = "Profile")]
    pub profile_level_id: String,
    #[serde(default, alias = "SpropParameterSets")]
    pub sprop_parameter_sets: String,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Offer(SessionOffer),
    Answer(SessionAnswer),
    /// Picture Loss Indication: the receiver wants a key frame.
    Pli,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize> {
    r#type: &'a str,
    payload: T,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(alias = "Type")]
    r#type: String,
    #[serde(default, alias = "Payload")]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct Empty {}

impl ControlMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Offer(_) => TYPE_OFFER,
            Self::Answer(_) => TYPE_ANSWER,
            Self::Pli => TYPE_PLI,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let r#type = self.type_name();
        let json = match self {
            Self::Offer(offer) => serde_json::to_string(&OutgoingEnvelope { r#type, payload: offer }),
            Self::Answer(answer) => {
                serde_json::to_string(&OutgoingEnvelope { r#type, payload: answer })
            }
            Self::Pli => serde_json::to_string(&OutgoingEnvelope { r#type, payload: Empty {} }),
        };
        Ok(json?)
    }

    /// Parse an envelope. Unknown types and missing required fields are
    /// errors the caller is expected to ignore.
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: IncomingEnvelope = serde_json::from_str(raw)?;
        let kind = envelope.r#type.to_ascii_lowercase();
        match kind.as_str() {
            TYPE_OFFER => Ok(Self::Offer(serde_json::from_value(envelope.payload)?)),
            TYPE_ANSWER => Ok(Self::Answer(serde_json::from_value(envelope.payload)?)),
            TYPE_PLI => Ok(Self::Pli),
            _ => Err(VideoError::NegotiationParse(serde_json::Error::unknown_variant(
                &envelope.r#type,
                &[TYPE_OFFER, TYPE_ANSWER, TYPE_PLI],
            ))),
        }
    }
}
