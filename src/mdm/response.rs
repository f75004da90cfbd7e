//! MDM command response types and the request-type parser registry.
//!
//! A response arriving from the webhook carries only raw plist bytes and a
//! command UUID; the engine looks up the request type it stored at enqueue
//! time and asks the [`ResponseRegistry`] to produce a typed response
//! object. Workflows downcast via [`MdmResponse::as_any`] when they need
//! more than `Status`.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{CodecError, Result};

/// Capability trait for typed MDM command responses.
pub trait MdmResponse: Send + Sync + std::fmt::Debug {
    /// The command UUID echoed by the device.
    fn command_uuid(&self) -> &str;

    /// The response status: `Acknowledged`, `Error`, `CommandFormatError`,
    /// `NotNow`, or empty when the device sent none.
    fn status(&self) -> &str;

    /// Downcast support for workflows that inspect response details.
    fn as_any(&self) -> &dyn Any;
}

/// The step-completion rule: a command is complete once its response
/// status is anything other than empty or `NotNow`.
pub fn response_completed(status: &str) -> bool {
    !status.is_empty() && status != "NotNow"
}

/// An entry in the `ErrorChain` array of an errored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorChainItem {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_domain: String,
    #[serde(default)]
    pub localized_description: String,
    #[serde(rename = "USEnglishDescription", default, skip_serializing_if = "Option::is_none")]
    pub us_english_description: Option<String>,
}

/// The response fields every MDM acknowledgement shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenericResponse {
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(rename = "EnrollmentID", default, skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_chain: Option<Vec<ErrorChainItem>>,
}

impl MdmResponse for GenericResponse {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn status(&self) -> &str {
        &self.status
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// DeviceInformation response: the queried attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInformationResponse {
    #[serde(flatten)]
    pub generic: GenericResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_responses: Option<plist::Dictionary>,
}

impl MdmResponse for DeviceInformationResponse {
    fn command_uuid(&self) -> &str {
        &self.generic.command_uuid
    }

    fn status(&self) -> &str {
        &self.generic.status
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// SecurityInfo response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityInfoResponse {
    #[serde(flatten)]
    pub generic: GenericResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_info: Option<plist::Dictionary>,
}

impl MdmResponse for SecurityInfoResponse {
    fn command_uuid(&self) -> &str {
        &self.generic.command_uuid
    }

    fn status(&self) -> &str {
        &self.generic.status
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// ProfileList response: one dictionary per installed profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProfileListResponse {
    #[serde(flatten)]
    pub generic: GenericResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_list: Option<Vec<plist::Dictionary>>,
}

impl MdmResponse for ProfileListResponse {
    fn command_uuid(&self) -> &str {
        &self.generic.command_uuid
    }

    fn status(&self) -> &str {
        &self.generic.status
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type ResponseParser = fn(&[u8]) -> Result<Box<dyn MdmResponse>>;

fn parse_as<T>(raw: &[u8]) -> Result<Box<dyn MdmResponse>>
where
    T: MdmResponse + DeserializeOwned + 'static,
{
    Ok(Box::new(plist::from_bytes::<T>(raw)?))
}

/// Request-type to response-parser lookup table.
///
/// A missing entry is a hard error: the engine refuses to guess at a
/// response shape it was never taught, and the untouched storage rows will
/// eventually time out.
pub struct ResponseRegistry {
    parsers: HashMap<String, ResponseParser>,
}

impl ResponseRegistry {
    /// An empty registry. Most callers want [`ResponseRegistry::with_core_types`].
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// A registry pre-loaded with parsers for the request types the bundled
    /// command builders cover.
    pub fn with_core_types() -> Self {
        let mut reg = Self::new();
        reg.register("DeviceInformation", parse_as::<DeviceInformationResponse>);
        reg.register("SecurityInfo", parse_as::<SecurityInfoResponse>);
        reg.register("ProfileList", parse_as::<ProfileListResponse>);
        reg.register("InstallProfile", parse_as::<GenericResponse>);
        reg.register("RemoveProfile", parse_as::<GenericResponse>);
        reg.register("DeviceLock", parse_as::<GenericResponse>);
        reg.register("EraseDevice", parse_as::<GenericResponse>);
        reg
    }

    /// Registers (or replaces) the parser for a request type.
    pub fn register(&mut self, request_type: impl Into<String>, parser: ResponseParser) {
        self.parsers.insert(request_type.into(), parser);
    }

    /// Parses raw response bytes for the given request type.
    pub fn parse(&self, request_type: &str, raw: &[u8]) -> Result<Box<dyn MdmResponse>> {
        let parser = self
            .parsers
            .get(request_type)
            .ok_or_else(|| CodecError::UnknownRequestType(request_type.to_string()))?;
        parser(raw)
    }

    /// Whether a parser is registered for the request type.
    pub fn contains(&self, request_type: &str) -> bool {
        self.parsers.contains_key(request_type)
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::with_core_types()
    }
}

/// Serializes a response acknowledgement to XML plist bytes.
///
/// Primarily useful for tests and for ingress adapters that re-emit
/// normalized acknowledgements.
pub fn response_to_plist<T: Serialize>(response: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, response)?;
    Ok(buf)
}
