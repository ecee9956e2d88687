//! Compute backends for data-parallel kernels.
//!
//! A kernel is a named WGSL compute shader with a fixed binding layout and a CPU twin that
//! emulates its workgroups. Kernels are dispatched in batches through a [`ComputeBackend`]:
//! - [`WgpuBackend`] runs the WGSL on a `wgpu` device.
//! - [`HostBackend`] runs the CPU twin, which is always available and serves as the
//!   correctness reference for the device path.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod backend;
pub mod composer;
pub mod error;
pub mod gpu;
pub mod host;
pub mod kernel;
pub mod tensor;
pub mod wgpu_backend;

pub use backend::{BackendExt, BufferHandle, BufferKind, ComputeBackend};
pub use error::{ComputeError, ComputeResult};
pub use host::HostBackend;
pub use kernel::{Binding, Dispatch, HostArgs, Kernel, KernelDispatch, MAX_WORKGROUPS};
pub use wgpu_backend::WgpuBackend;
