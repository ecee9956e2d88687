//! The compute backend trait.

use crate::error::ComputeResult;
use crate::kernel::Dispatch;
use bytemuck::Pod;

/// Opaque handle to a buffer owned by a [`ComputeBackend`].
///
/// Handles are only meaningful for the backend that allocated them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

/// How a buffer is bound to kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Storage buffer, bound read-only or read-write.
    Storage,
    /// Small uniform buffer holding kernel parameters.
    Uniform,
}

/// A device able to run batches of compute kernels over buffers it owns.
///
/// Orchestration is synchronous: [`ComputeBackend::run_batch`] returns once every dispatch of
/// the batch completed, and consecutive dispatches of a batch are separated by full barriers.
///
/// # Implementations
/// - [`HostBackend`](crate::HostBackend): CPU emulation of the kernels (always available).
/// - [`WgpuBackend`](crate::WgpuBackend): `wgpu` device.
pub trait ComputeBackend {
    /// Returns the backend name (e.g. `"host"`, `"wgpu (Vulkan)"`).
    fn name(&self) -> &str;

    /// Returns `true` if kernels run on a GPU.
    fn is_gpu(&self) -> bool;

    /// Allocates a zero-initialized buffer of `size_bytes` bytes.
    fn allocate(&mut self, size_bytes: u64, kind: BufferKind) -> ComputeResult<BufferHandle>;

    /// Frees a buffer. The handle must not be used afterwards.
    fn release(&mut self, buffer: BufferHandle) -> ComputeResult<()>;

    /// The size, in bytes, requested when `buffer` was allocated.
    fn size_of(&self, buffer: BufferHandle) -> ComputeResult<u64>;

    /// The kind `buffer` was allocated with.
    fn kind_of(&self, buffer: BufferHandle) -> ComputeResult<BufferKind>;

    /// Writes `bytes` at the start of `buffer`.
    ///
    /// # Errors
    ///
    /// Fails if `bytes` is longer than the buffer or its length is not a multiple of 4.
    fn upload(&mut self, buffer: BufferHandle, bytes: &[u8]) -> ComputeResult<()>;

    /// Reads the first `byte_count` bytes of `buffer`.
    ///
    /// Blocks until every previously submitted batch completed.
    fn download(&mut self, buffer: BufferHandle, byte_count: u64) -> ComputeResult<Vec<u8>>;

    /// Runs every dispatch of `batch` in order, with a full barrier between consecutive
    /// dispatches, and blocks until completion.
    ///
    /// The whole batch is validated before anything runs: an invalid binding is reported as a
    /// configuration error and no dispatch is executed.
    fn run_batch(&mut self, batch: &[Dispatch<'_>]) -> ComputeResult<()>;
}

/// Typed helpers available on every [`ComputeBackend`].
pub trait BackendExt: ComputeBackend {
    /// Uploads a slice of plain-old-data values.
    fn upload_slice<T: Pod>(&mut self, buffer: BufferHandle, data: &[T]) -> ComputeResult<()> {
        self.upload(buffer, bytemuck::cast_slice(data))
    }

    /// Downloads the first `len` values of a buffer.
    fn download_vec<T: Pod>(&mut self, buffer: BufferHandle, len: usize) -> ComputeResult<Vec<T>> {
        let bytes = self.download(buffer, (len * std::mem::size_of::<T>()) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Runs a single dispatch as its own batch.
    fn run(&mut self, dispatch: Dispatch<'_>) -> ComputeResult<()> {
        self.run_batch(std::slice::from_ref(&dispatch))
    }
}

impl<B: ComputeBackend + ?Sized> BackendExt for B {}
