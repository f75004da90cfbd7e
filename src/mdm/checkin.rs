//! MDM check-in message types.
//!
//! These mirror Apple's check-in request schema closely enough for event
//! dispatch; fields the engine never reads are still carried so workflows
//! subscribed to check-in events can inspect them.

use serde::{Deserialize, Serialize};

use super::error::{CodecError, Result};

/// Enrollment identifier fields common to all check-in messages.
///
/// Which fields are present depends on the enrollment type (device vs.
/// user channel).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrollmentIdentifiers {
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(rename = "UserID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_long_name: Option<String>,
    #[serde(rename = "EnrollmentID", default, skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "EnrollmentUserID", default, skip_serializing_if = "Option::is_none")]
    pub enrollment_user_id: Option<String>,
}

/// Authenticate check-in message (`MessageType` = "Authenticate").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Authenticate {
    #[serde(flatten)]
    pub enrollment: EnrollmentIdentifiers,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(rename = "IMEI", default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    #[serde(rename = "MEID", default, skip_serializing_if = "Option::is_none")]
    pub meid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(rename = "OSVersion", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// TokenUpdate check-in message (`MessageType` = "TokenUpdate").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenUpdate {
    #[serde(flatten)]
    pub enrollment: EnrollmentIdentifiers,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub push_magic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<plist::Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_token: Option<plist::Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_configuration: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_on_console: Option<bool>,
}

/// CheckOut check-in message (`MessageType` = "CheckOut").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckOut {
    #[serde(flatten)]
    pub enrollment: EnrollmentIdentifiers,
    #[serde(default)]
    pub topic: String,
}

/// A tagged check-in message delivered to the engine.
///
/// `TokenUpdateEnrolling` is a TokenUpdate annotated by an ingress adapter
/// that can tally enrollments and therefore knows whether this particular
/// TokenUpdate is the enrolling one. A bare `TokenUpdate` is ambiguous:
/// the engine dispatches both the TokenUpdate and the Enrollment events
/// for it.
#[derive(Debug, Clone)]
pub enum CheckinMessage {
    Authenticate(Authenticate),
    TokenUpdate(TokenUpdate),
    TokenUpdateEnrolling {
        token_update: TokenUpdate,
        enrolling: bool,
    },
    CheckOut(CheckOut),
}

impl CheckinMessage {
    /// Parses raw check-in plist bytes for a given `MessageType`.
    ///
    /// Returns [`CodecError::UnknownRequestType`] for message types the
    /// engine does not react to (e.g. GetBootstrapToken).
    pub fn parse(message_type: &str, raw: &[u8]) -> Result<Self> {
        match message_type {
            "Authenticate" => Ok(Self::Authenticate(plist::from_bytes(raw)?)),
            "TokenUpdate" => Ok(Self::TokenUpdate(plist::from_bytes(raw)?)),
            "CheckOut" => Ok(Self::CheckOut(plist::from_bytes(raw)?)),
            other => Err(CodecError::UnknownRequestType(other.to_string())),
        }
    }

    /// The wire `MessageType` for this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "Authenticate",
            Self::TokenUpdate(_) | Self::TokenUpdateEnrolling { .. } => "TokenUpdate",
            Self::CheckOut(_) => "CheckOut",
        }
    }
}
