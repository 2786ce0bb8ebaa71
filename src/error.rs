//! Fault taxonomy for the transport core.
//!
//! Transport faults are absorbed by the frame pump (the previous composited
//! frame stays on screen). Import and synchronization faults are returned to
//! the pump's caller. Contract violations are not errors at all; see
//! [`fatal`](crate::fatal).

use crate::types::{FenceHandle, PixelFormat, PixelSize, ProducerKind, TargetHandle, TextureHandle};

/// The snapshot channel could not produce a consistent snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// The producer has not published a frame yet.
    #[error("transport fault: no snapshot has been published")]
    NeverPublished,

    /// Every read attempt raced a writer.
    #[error("transport fault: snapshot still changing after {attempts} read attempts")]
    Contended {
        /// How many consistent-read attempts were made.
        attempts: u32,
    },

    /// The channel holds a tag this build does not understand.
    #[error("transport fault: unrecognized {field} tag {found} in channel")]
    LayoutMismatch {
        /// Name of the offending field.
        field: &'static str,
        /// The raw value read.
        found: u32,
    },
}

/// A native handle could not be turned into a live GPU object.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportFault {
    /// The texture handle does not name a live shared texture.
    #[error("import fault: texture handle {0:?} is invalid or stale")]
    InvalidTexture(TextureHandle),

    /// The fence handle does not name a live shared fence.
    #[error("import fault: fence handle {0:?} is invalid or stale")]
    InvalidFence(FenceHandle),

    /// The destination handle does not name a usable surface.
    #[error("import fault: destination handle {0:?} is invalid or stale")]
    InvalidTarget(TargetHandle),

    /// The producer's API cannot be imported by this device.
    #[error("import fault: {device} device cannot import {producer:?} resources")]
    DeviceMismatch {
        /// Name of the importing device.
        device: &'static str,
        /// The producer kind found in the snapshot.
        producer: ProducerKind,
    },

    /// The shared texture's format differs from the advertised one.
    #[error("import fault: expected {expected:?} texture, found {found:?}")]
    FormatMismatch {
        /// Format advertised in the snapshot.
        expected: PixelFormat,
        /// Format of the actual resource.
        found: PixelFormat,
    },

    /// The shared texture's size differs from the advertised one.
    #[error("import fault: expected {expected:?} texture, found {found:?}")]
    SizeMismatch {
        /// Size advertised in the snapshot.
        expected: PixelSize,
        /// Size of the actual resource.
        found: PixelSize,
    },

    /// The backend API reported an error.
    #[error("import fault: {0}")]
    Backend(String),
}

/// GPU-side wait or signal could not be submitted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SynchronizationFault {
    /// A fence did not reach its target value within the configured bound.
    #[error("synchronization fault: fence did not reach {value} within {timeout_ms} ms")]
    WaitTimeout {
        /// The value being waited for.
        value: u64,
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// Command submission failed.
    #[error("synchronization fault: submission failed: {0}")]
    Submit(String),

    /// A signal would move a fence backwards.
    #[error("synchronization fault: fence is at {current}, cannot signal {requested}")]
    NonMonotonicSignal {
        /// Value already signaled.
        current: u64,
        /// Value requested.
        requested: u64,
    },
}

/// Why a frame-pump tick failed. Returned to the pump's caller, who decides
/// whether to retry next tick or report the device as lost.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Resolving the snapshot or opening the destination failed.
    #[error(transparent)]
    Import(#[from] ImportFault),

    /// Submitting the composited work failed.
    #[error(transparent)]
    Synchronization(#[from] SynchronizationFault),
}

/// The relay configuration is unusable.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A field holds an out-of-range value.
    #[error("config error: {0}")]
    Invalid(String),

    /// The configuration could not be parsed.
    #[error("config error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("config error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
