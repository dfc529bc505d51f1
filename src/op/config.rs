//! Deferred fields and the bounded pre-serialization configuration loop.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Operation, OperationError};

/// Upper bound on configuration steps for a single operation.
///
/// No variant needs more than two steps; reaching the bound means a
/// variant keeps reporting a pending field after being configured.
pub const MAX_CONFIG_ITERATIONS: usize = 10;

/// A field that may be absent at construction and supplied later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Offset within a segment at which the operation lands.
    Offset,
    /// Length of a segment observed at configuration time.
    Length,
    /// Opaque checkpoint contents.
    Contents,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offset => "offset",
            Self::Length => "length",
            Self::Contents => "contents",
        };
        f.write_str(name)
    }
}

/// Value for one deferred field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredValue {
    /// Segment offset.
    Offset(i64),
    /// Segment length.
    Length(i64),
    /// Checkpoint contents.
    Contents(Vec<u8>),
}

impl DeferredValue {
    /// Field this value configures.
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Offset(_) => FieldKind::Offset,
            Self::Length(_) => FieldKind::Length,
            Self::Contents(_) => FieldKind::Contents,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), OperationError> {
        match *self {
            Self::Offset(value) | Self::Length(value) if value < 0 => {
                Err(OperationError::NegativeValue {
                    field: self.kind(),
                    value,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Source of deferred field values, asked one field at a time.
pub trait PreSerializationConfigurator {
    /// Error type; must absorb operation state errors raised by the loop.
    type Error: From<OperationError>;

    /// Produces the value for `field`, the next field `operation` needs.
    fn supply(&mut self, operation: &Operation, field: FieldKind) -> Result<DeferredValue, Self::Error>;
}

/// Repeatedly asks `configurator` for the pending field of `operation`
/// until the operation needs nothing more. Returns the number of steps.
pub fn configure_until_ready<C>(operation: &mut Operation, configurator: &mut C) -> Result<usize, C::Error>
where
    C: PreSerializationConfigurator + ?Sized,
{
    let mut steps = 0usize;
    while let Some(field) = operation.pending_field() {
        if steps == MAX_CONFIG_ITERATIONS {
            return Err(OperationError::ConfigurationLimitExceeded(MAX_CONFIG_ITERATIONS).into());
        }
        let value = configurator.supply(operation, field)?;
        operation.configure(value)?;
        steps += 1;
    }
    Ok(steps)
}
