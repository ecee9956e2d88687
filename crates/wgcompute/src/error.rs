//! Error type shared by every compute backend.

use crate::backend::{BufferHandle, BufferKind};
use thiserror::Error;

/// Errors reported by compute backends and the engines built on top of them.
///
/// Variants fall in two families:
/// - configuration errors, detected before anything is dispatched (see
///   [`ComputeError::is_config_error`]);
/// - backend errors, raised by the device itself while allocating, running or reading back.
///   Any buffer written by the failing batch must be considered invalid afterwards.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer is smaller than what an operation needs.
    #[error("Buffer `{what}` is too small: {required} bytes required, {available} available")]
    BufferTooSmall {
        /// Role of the undersized buffer.
        what: String,
        /// Minimum size, in bytes.
        required: u64,
        /// Actual size, in bytes.
        available: u64,
    },

    /// Two arrays that must have the same length do not.
    #[error("Length mismatch for `{what}`: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Role of the mismatched array.
        what: String,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// The handle does not name a live buffer of this backend.
    #[error("Unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),

    /// A dispatch does not bind as many buffers as its kernel declares.
    #[error("Kernel `{kernel}` expects {expected} bindings, got {actual}")]
    BindingCount {
        /// Kernel name.
        kernel: &'static str,
        /// Number of declared bindings.
        expected: usize,
        /// Number of bound buffers.
        actual: usize,
    },

    /// A buffer of the wrong kind is bound to a slot.
    #[error("Kernel `{kernel}`: binding {slot} expects a {expected:?} buffer, got {actual:?}")]
    BindingKind {
        /// Kernel name.
        kernel: &'static str,
        /// Binding index.
        slot: usize,
        /// Kind required by the slot.
        expected: BufferKind,
        /// Kind of the bound buffer.
        actual: BufferKind,
    },

    /// A buffer bound to a writable slot is bound to another slot of the same dispatch.
    #[error("Kernel `{kernel}`: buffer {buffer:?} is bound to a writable slot and to another slot")]
    AliasedBinding {
        /// Kernel name.
        kernel: &'static str,
        /// The aliased buffer.
        buffer: BufferHandle,
    },

    /// A dispatch has zero workgroups or more than the dispatch limit.
    #[error("Kernel `{kernel}`: invalid workgroup count {num_groups}")]
    WorkgroupCount {
        /// Kernel name.
        kernel: &'static str,
        /// Requested number of workgroups.
        num_groups: u32,
    },

    /// The backend could not allocate a buffer.
    #[error("Allocation of {size} bytes failed: {reason}")]
    Allocation {
        /// Requested size, in bytes.
        size: u64,
        /// Backend-provided reason.
        reason: String,
    },

    /// The WGSL of a kernel could not be composed or failed validation.
    #[error("Kernel `{kernel}` does not compile: {reason}")]
    Compose {
        /// Kernel name.
        kernel: &'static str,
        /// Composer or validator message.
        reason: String,
    },

    /// A value could not be written to, or read from, a uniform buffer.
    #[error("Uniform encoding of `{what}` failed: {reason}")]
    Encoding {
        /// Role of the encoded value.
        what: String,
        /// Reason reported by the encoder.
        reason: String,
    },

    /// A kernel failed to compile or to run.
    #[error("Kernel `{kernel}` failed: {reason}")]
    Dispatch {
        /// Kernel name, or the batch label.
        kernel: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// Reading a buffer back to the host failed.
    #[error("Readback failed: {0}")]
    Readback(String),

    /// Waiting for submitted work failed.
    #[error("Device wait failed: {0}")]
    Wait(String),
}

impl ComputeError {
    /// Is this error detected before any work is submitted?
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::BufferTooSmall { .. }
                | Self::LengthMismatch { .. }
                | Self::UnknownBuffer(_)
                | Self::BindingCount { .. }
                | Self::BindingKind { .. }
                | Self::AliasedBinding { .. }
                | Self::WorkgroupCount { .. }
                | Self::Encoding { .. }
        )
    }

    /// Was this error raised by the device while allocating, running, or reading back?
    pub fn is_backend_error(&self) -> bool {
        !self.is_config_error()
    }

    /// Shorthand for [`ComputeError::BufferTooSmall`].
    pub fn too_small(what: impl Into<String>, required: u64, available: u64) -> Self {
        Self::BufferTooSmall {
            what: what.into(),
            required,
            available,
        }
    }

    /// Wraps a `naga_oil` error raised while composing `kernel`.
    pub fn compose(kernel: &'static str, err: naga_oil::compose::ComposerError) -> Self {
        Self::Compose {
            kernel,
            reason: err.to_string(),
        }
    }

    /// Wraps an `encase` error raised while encoding `what`.
    pub fn encoding(what: impl Into<String>, err: encase::internal::Error) -> Self {
        Self::Encoding {
            what: what.into(),
            reason: err.to_string(),
        }
    }
}

/// Convenience alias for `Result<T, ComputeError>`.
pub type ComputeResult<T> = Result<T, ComputeError>;
