//! MDM protocol seam.
//!
//! The engine deliberately knows very little about the MDM protocol: a
//! command is opaque plist bytes plus a command UUID and a request-type
//! label, and a response is opaque bytes from which only `CommandUUID` and
//! `Status` matter for tracking. This module holds exactly that boundary:
//!
//! - [`CheckinMessage`]: tagged sum over the check-in messages the engine
//!   reacts to (Authenticate, TokenUpdate, CheckOut).
//! - [`MdmCommand`] / [`MdmResponse`]: capability traits workflow command
//!   and response types satisfy.
//! - [`ResponseRegistry`]: the request-type to parser table used to turn
//!   raw response plists back into typed objects.
//! - [`RawEnqueuer`] / [`Enqueuer`] / [`PushEnqueuer`]: the transport
//!   interfaces the engine and worker consume. Implementations talk to the
//!   actual MDM server and APNs; the engine never does.

mod checkin;
mod command;
mod enqueue;
mod error;
mod response;

pub(crate) use command::validate_command;

pub use checkin::{Authenticate, CheckOut, CheckinMessage, EnrollmentIdentifiers, TokenUpdate};
pub use command::{
    plist_command, CommandBody, DeviceInformationCommand, DeviceLockCommand, EraseDeviceCommand,
    GenericCommand, InstallProfileCommand, MdmCommand, ProfileListCommand, RemoveProfileCommand,
    SecurityInfoCommand,
};
pub use enqueue::{Enqueuer, PushEnqueuer, RawEnqueuer};
pub use error::CodecError;
pub use response::{
    response_completed, response_to_plist, DeviceInformationResponse, ErrorChainItem,
    GenericResponse, MdmResponse, ProfileListResponse, ResponseRegistry, SecurityInfoResponse,
};
