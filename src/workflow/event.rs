//! MDM event flags and event payloads.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mdm::{CheckinMessage, MdmResponse};

/// A bitmask of MDM event types.
///
/// Storage backends persist these numeric values; treat the bit
/// assignments as append-only. The wire-visible names are the strings
/// returned by [`EventFlag::name`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFlag(u32);

impl EventFlag {
    /// No events.
    pub const NONE: EventFlag = EventFlag(0);

    /// Any engine-tracked command response (see
    /// [`super::Config::all_command_response_request_types`]).
    pub const ALL_COMMAND_RESPONSE: EventFlag = EventFlag(1 << 0);

    /// Authenticate check-in message.
    pub const AUTHENTICATE: EventFlag = EventFlag(1 << 1);

    /// TokenUpdate check-in message. TokenUpdate and Enrollment are
    /// distinct because an enrollment enrolls once while TokenUpdates can
    /// continually arrive.
    pub const TOKEN_UPDATE: EventFlag = EventFlag(1 << 2);

    /// The enrolling TokenUpdate of an enrollment.
    pub const ENROLLMENT: EventFlag = EventFlag(1 << 3);

    /// CheckOut check-in message.
    pub const CHECK_OUT: EventFlag = EventFlag(1 << 4);

    /// An "Idle" command report status.
    pub const IDLE: EventFlag = EventFlag(1 << 5);

    /// Pseudo-event: an Idle arrived and the subscribed workflow has not
    /// started for this id within the subscription's configured window.
    /// The only event type that may start workflows from the Idle path.
    pub const IDLE_NOT_STARTED_SINCE: EventFlag = EventFlag(1 << 6);

    const MAX: u32 = 1 << 7;

    /// True for exactly one known flag bit.
    pub fn is_valid(self) -> bool {
        self.0 > 0 && self.0 < Self::MAX && self.0.is_power_of_two()
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: EventFlag) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// True when `self` and `other` share any bit.
    pub fn intersects(self, other: EventFlag) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> EventFlag {
        EventFlag(bits)
    }

    /// The wire name of a single flag, or `None` for unknown/compound
    /// masks.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::ALL_COMMAND_RESPONSE => Some("AllCommandResponse"),
            Self::AUTHENTICATE => Some("Authenticate"),
            Self::TOKEN_UPDATE => Some("TokenUpdate"),
            Self::ENROLLMENT => Some("Enrollment"),
            Self::CHECK_OUT => Some("CheckOut"),
            Self::IDLE => Some("Idle"),
            Self::IDLE_NOT_STARTED_SINCE => Some("IdleNotStartedSince"),
            _ => None,
        }
    }

    /// Parses a wire name back to its flag.
    pub fn from_name(name: &str) -> Option<EventFlag> {
        match name {
            "AllCommandResponse" => Some(Self::ALL_COMMAND_RESPONSE),
            "Authenticate" => Some(Self::AUTHENTICATE),
            "TokenUpdate" => Some(Self::TOKEN_UPDATE),
            "Enrollment" => Some(Self::ENROLLMENT),
            "CheckOut" => Some(Self::CHECK_OUT),
            "Idle" => Some(Self::IDLE),
            "IdleNotStartedSince" => Some(Self::IDLE_NOT_STARTED_SINCE),
            _ => None,
        }
    }

    /// Iterates the individual known flags set in this mask.
    pub fn iter(self) -> impl Iterator<Item = EventFlag> {
        (0..7).map(|i| EventFlag(1 << i)).filter(move |f| self.contains(*f))
    }
}

impl BitOr for EventFlag {
    type Output = EventFlag;

    fn bitor(self, rhs: EventFlag) -> EventFlag {
        EventFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlag {
    fn bitor_assign(&mut self, rhs: EventFlag) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown event type: {}", self.0),
        }
    }
}

/// The payload accompanying an event, shared across all subscribers.
#[derive(Clone, Default)]
pub enum EventData {
    #[default]
    None,
    /// The check-in message that produced the event.
    Checkin(Arc<CheckinMessage>),
    /// The parsed command response, for
    /// [`EventFlag::ALL_COMMAND_RESPONSE`] events. Subscribers get a
    /// read-only view.
    Response(Arc<dyn MdmResponse>),
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Checkin(c) => f.debug_tuple("Checkin").field(&c.message_type()).finish(),
            Self::Response(r) => f.debug_tuple("Response").field(&r.command_uuid()).finish(),
        }
    }
}

/// A specific workflow MDM event.
#[derive(Debug, Clone)]
pub struct Event {
    pub flag: EventFlag,
    pub data: EventData,
}

impl Event {
    pub fn new(flag: EventFlag) -> Self {
        Self {
            flag,
            data: EventData::None,
        }
    }

    pub fn with_data(flag: EventFlag, data: EventData) -> Self {
        Self { flag, data }
    }
}
