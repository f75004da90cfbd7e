//! MDM command types and the command capability trait.
//!
//! The engine only ever sees a command through [`MdmCommand`]: a UUID, a
//! request-type label, and serialized plist bytes. Workflows are free to
//! define their own command types; the structs here cover the request
//! types the bundled response parsers understand.

use serde::Serialize;

use super::error::{CodecError, Result};

/// Capability trait for enqueueable MDM commands.
///
/// Anything a workflow hands to the engine for enqueueing must expose its
/// UUID and request type and be able to serialize itself to an XML
/// property list.
pub trait MdmCommand: Send + Sync {
    /// The command UUID. Must be unique per enrollment id across all live
    /// commands; the engine uses it as the sole correlation key between a
    /// response and its step.
    fn command_uuid(&self) -> &str;

    /// The MDM request type, e.g. `"DeviceInformation"`.
    fn request_type(&self) -> &str;

    /// Serializes the full command envelope to XML plist bytes.
    fn to_plist(&self) -> Result<Vec<u8>>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "CommandUUID")]
    command_uuid: &'a str,
    command: &'a T,
}

/// Serializes an Apple MDM command envelope (`CommandUUID` + `Command`
/// dictionary) to XML plist bytes.
pub fn plist_command<T: Serialize>(command_uuid: &str, body: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_xml(
        &mut buf,
        &Envelope {
            command_uuid,
            command: body,
        },
    )?;
    Ok(buf)
}

/// An untyped command body: a request type plus arbitrary parameters.
///
/// Useful for request types without a dedicated struct, and for tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandBody {
    pub request_type: String,
    #[serde(flatten)]
    pub parameters: plist::Dictionary,
}

/// A generic command: UUID plus an untyped [`CommandBody`].
#[derive(Debug, Clone)]
pub struct GenericCommand {
    pub command_uuid: String,
    pub body: CommandBody,
}

impl GenericCommand {
    pub fn new(command_uuid: impl Into<String>, request_type: impl Into<String>) -> Self {
        Self {
            command_uuid: command_uuid.into(),
            body: CommandBody {
                request_type: request_type.into(),
                parameters: plist::Dictionary::new(),
            },
        }
    }
}

impl MdmCommand for GenericCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        &self.body.request_type
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        plist_command(&self.command_uuid, &self.body)
    }
}

/// DeviceInformation command: queries device attributes.
#[derive(Debug, Clone)]
pub struct DeviceInformationCommand {
    pub command_uuid: String,
    pub queries: Vec<String>,
}

impl MdmCommand for DeviceInformationCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "DeviceInformation"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Body<'a> {
            request_type: &'a str,
            queries: &'a [String],
        }
        plist_command(
            &self.command_uuid,
            &Body {
                request_type: self.request_type(),
                queries: &self.queries,
            },
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BareBody<'a> {
    request_type: &'a str,
}

/// SecurityInfo command: queries security-related attributes (FileVault
/// state, firewall, and friends).
#[derive(Debug, Clone)]
pub struct SecurityInfoCommand {
    pub command_uuid: String,
}

impl MdmCommand for SecurityInfoCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "SecurityInfo"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        plist_command(
            &self.command_uuid,
            &BareBody {
                request_type: self.request_type(),
            },
        )
    }
}

/// ProfileList command: lists installed configuration profiles.
#[derive(Debug, Clone)]
pub struct ProfileListCommand {
    pub command_uuid: String,
}

impl MdmCommand for ProfileListCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "ProfileList"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        plist_command(
            &self.command_uuid,
            &BareBody {
                request_type: self.request_type(),
            },
        )
    }
}

/// InstallProfile command: installs a configuration profile payload.
#[derive(Debug, Clone)]
pub struct InstallProfileCommand {
    pub command_uuid: String,
    pub payload: plist::Data,
}

impl MdmCommand for InstallProfileCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "InstallProfile"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Body<'a> {
            request_type: &'a str,
            payload: &'a plist::Data,
        }
        plist_command(
            &self.command_uuid,
            &Body {
                request_type: self.request_type(),
                payload: &self.payload,
            },
        )
    }
}

/// RemoveProfile command: removes a profile by identifier.
#[derive(Debug, Clone)]
pub struct RemoveProfileCommand {
    pub command_uuid: String,
    pub identifier: String,
}

impl MdmCommand for RemoveProfileCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "RemoveProfile"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Body<'a> {
            request_type: &'a str,
            identifier: &'a str,
        }
        plist_command(
            &self.command_uuid,
            &Body {
                request_type: self.request_type(),
                identifier: &self.identifier,
            },
        )
    }
}

/// DeviceLock command: locks the device, optionally with a PIN and a
/// message shown on the lock screen.
#[derive(Debug, Clone, Default)]
pub struct DeviceLockCommand {
    pub command_uuid: String,
    pub pin: Option<String>,
    pub message: Option<String>,
}

impl MdmCommand for DeviceLockCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "DeviceLock"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Body<'a> {
            request_type: &'a str,
            #[serde(rename = "PIN", skip_serializing_if = "Option::is_none")]
            pin: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            message: Option<&'a str>,
        }
        plist_command(
            &self.command_uuid,
            &Body {
                request_type: self.request_type(),
                pin: self.pin.as_deref(),
                message: self.message.as_deref(),
            },
        )
    }
}

/// EraseDevice command: remotely wipes the device.
#[derive(Debug, Clone, Default)]
pub struct EraseDeviceCommand {
    pub command_uuid: String,
    pub pin: Option<String>,
}

impl MdmCommand for EraseDeviceCommand {
    fn command_uuid(&self) -> &str {
        &self.command_uuid
    }

    fn request_type(&self) -> &str {
        "EraseDevice"
    }

    fn to_plist(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Body<'a> {
            request_type: &'a str,
            #[serde(rename = "PIN", skip_serializing_if = "Option::is_none")]
            pin: Option<&'a str>,
        }
        plist_command(
            &self.command_uuid,
            &Body {
                request_type: self.request_type(),
                pin: self.pin.as_deref(),
            },
        )
    }
}

/// Validates the invariants every enqueued command must satisfy.
pub(crate) fn validate_command(cmd: &dyn MdmCommand) -> Result<()> {
    if cmd.command_uuid().is_empty() {
        return Err(CodecError::EmptyCommandUuid);
    }
    if cmd.request_type().is_empty() {
        return Err(CodecError::EmptyRequestType);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_information_envelope() {
        let cmd = DeviceInformationCommand {
            command_uuid: "UUID-1".to_string(),
            queries: vec!["UDID".to_string(), "OSVersion".to_string()],
        };
        assert_eq!(cmd.request_type(), "DeviceInformation");
        let raw = cmd.to_plist().unwrap();
        let value: plist::Value = plist::from_bytes(&raw).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert_eq!(
            dict.get("CommandUUID").and_then(|v| v.as_string()),
            Some("UUID-1")
        );
        let body = dict.get("Command").and_then(|v| v.as_dictionary()).unwrap();
        assert_eq!(
            body.get("RequestType").and_then(|v| v.as_string()),
            Some("DeviceInformation")
        );
        assert_eq!(body.get("Queries").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));
    }

    #[test]
    fn device_lock_omits_absent_pin() {
        let cmd = DeviceLockCommand {
            command_uuid: "UUID-2".to_string(),
            ..Default::default()
        };
        let raw = cmd.to_plist().unwrap();
        let value: plist::Value = plist::from_bytes(&raw).unwrap();
        let body = value
            .as_dictionary()
            .and_then(|d| d.get("Command"))
            .and_then(|v| v.as_dictionary())
            .unwrap();
        assert!(body.get("PIN").is_none());
    }

    #[test]
    fn empty_uuid_rejected() {
        let cmd = GenericCommand::new("", "DeviceInformation");
        assert!(matches!(
            validate_command(&cmd),
            Err(CodecError::EmptyCommandUuid)
        ));
    }

    #[test]
    fn empty_request_type_rejected() {
        let cmd = GenericCommand::new("UUID-1", "");
        assert!(matches!(
            validate_command(&cmd),
            Err(CodecError::EmptyRequestType)
        ));
    }
}
