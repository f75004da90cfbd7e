//! Opaque per-step context.
//!
//! Workflows attach arbitrary data to a step; the engine carries it across
//! persistence as a binary blob and reconstitutes the right type on the
//! way back by asking the workflow for a fresh value
//! ([`super::Workflow::new_context_value`]) and unmarshalling into it.

use std::any::Any;
use std::collections::HashMap;

use crate::BoxError;

/// Marshals and unmarshals a context value to and from bytes.
///
/// Components that move context around (storage backends, HTTP handlers)
/// never care what the bytes mean.
pub trait ContextMarshaler: Send + std::fmt::Debug {
    fn marshal(&self) -> Result<Vec<u8>, BoxError>;

    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError>;

    /// Downcast support so workflows can recover their concrete context
    /// type from a step callback.
    fn as_any(&self) -> &dyn Any;
}

/// Context related to the MDM server, enrollment, and/or MDM request.
#[derive(Debug, Clone, Default)]
pub struct MdmContext {
    /// URL parameters from the MDM request (set on the `CheckInURL` or
    /// `ServerURL` in the enrollment profile). Present only for context
    /// originating from an MDM request.
    pub params: HashMap<String, String>,
}

/// A plain string context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringContext(pub String);

impl ContextMarshaler for StringContext {
    fn marshal(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.0.clone().into_bytes())
    }

    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
        self.0 = String::from_utf8(data.to_vec())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A plain integer context, stored as decimal text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntContext(pub i64);

impl ContextMarshaler for IntContext {
    fn marshal(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.0.to_string().into_bytes())
    }

    fn unmarshal(&mut self, data: &[u8]) -> Result<(), BoxError> {
        self.0 = std::str::from_utf8(data)?.parse()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
