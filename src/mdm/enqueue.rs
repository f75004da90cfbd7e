//! Transport interfaces the engine consumes.
//!
//! Implementations bridge to an actual MDM server: enqueueing raw command
//! plists for delivery and asking APNs to wake devices. The engine never
//! serializes access to a transport; implementations must tolerate
//! concurrent calls.

use async_trait::async_trait;

use crate::BoxError;

/// Sends raw plist commands to enrollment ids.
#[async_trait]
pub trait RawEnqueuer: Send + Sync {
    /// Queues `raw_command` for delivery to every id in `ids` and sends
    /// the associated APNs notifications.
    async fn enqueue(&self, ids: &[String], raw_command: &[u8]) -> Result<(), BoxError>;
}

/// A [`RawEnqueuer`] that also advertises whether a single command may
/// target multiple enrollment ids.
///
/// When multi-targeting is unsupported the engine fans a multi-id workflow
/// start into one start per id, so workflows can mint one command UUID per
/// step without caring about the transport's capability.
pub trait Enqueuer: RawEnqueuer {
    fn supports_multi_commands(&self) -> bool;
}

/// A [`RawEnqueuer`] that can additionally send bare APNs pushes, used by
/// the worker to re-wake devices with long-outstanding commands.
#[async_trait]
pub trait PushEnqueuer: RawEnqueuer {
    /// Sends an APNs notification (no command bytes) to every id.
    async fn push(&self, ids: &[String]) -> Result<(), BoxError>;
}
