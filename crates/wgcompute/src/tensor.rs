//! Typed views over backend buffers.

use crate::backend::{BackendExt, BufferHandle, BufferKind, ComputeBackend};
use crate::error::{ComputeError, ComputeResult};
use bytemuck::Pod;
use encase::internal::{CreateFrom, WriteInto};
use encase::{ShaderType, UniformBuffer};
use std::marker::PhantomData;

/// A storage buffer holding `len` elements of type `T`.
pub struct GpuVector<T> {
    buffer: BufferHandle,
    len: u64,
    phantom: PhantomData<T>,
}

impl<T> Clone for GpuVector<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GpuVector<T> {}

impl<T> std::fmt::Debug for GpuVector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuVector")
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Pod> GpuVector<T> {
    /// Allocates a storage buffer initialized with `data`.
    pub fn init<B: ComputeBackend + ?Sized>(backend: &mut B, data: &[T]) -> ComputeResult<Self> {
        let result = Self::uninit(backend, data.len() as u64)?;
        if !data.is_empty() {
            backend.upload_slice(result.buffer, data)?;
        }
        Ok(result)
    }

    /// Allocates a storage buffer of `len` elements.
    ///
    /// Both backends zero the memory of new buffers.
    pub fn uninit<B: ComputeBackend + ?Sized>(backend: &mut B, len: u64) -> ComputeResult<Self> {
        let size = len * std::mem::size_of::<T>() as u64;
        let buffer = backend.allocate(size, BufferKind::Storage)?;
        Ok(Self {
            buffer,
            len,
            phantom: PhantomData,
        })
    }

    /// Overwrites the first `data.len()` elements.
    pub fn write<B: ComputeBackend + ?Sized>(&self, backend: &mut B, data: &[T]) -> ComputeResult<()> {
        if data.len() as u64 > self.len {
            return Err(ComputeError::too_small(
                "vector write",
                std::mem::size_of_val(data) as u64,
                self.size_bytes(),
            ));
        }
        backend.upload_slice(self.buffer, data)
    }

    /// Reads the whole vector back.
    pub fn read<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> ComputeResult<Vec<T>> {
        backend.download_vec(self.buffer, self.len as usize)
    }

    /// Reads the first `len` elements back.
    pub fn read_prefix<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        len: usize,
    ) -> ComputeResult<Vec<T>> {
        backend.download_vec(self.buffer, len.min(self.len as usize))
    }

    /// Frees the underlying buffer.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) -> ComputeResult<()> {
        backend.release(self.buffer)
    }

    /// The size of the vector in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.len * std::mem::size_of::<T>() as u64
    }
}

impl<T> GpuVector<T> {
    /// The handle of the underlying buffer.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// The number of elements.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Is this vector empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A uniform buffer holding a single value of type `T`, typically kernel parameters.
pub struct GpuScalar<T> {
    buffer: BufferHandle,
    phantom: PhantomData<T>,
}

impl<T> Clone for GpuScalar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GpuScalar<T> {}

impl<T> std::fmt::Debug for GpuScalar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuScalar")
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<T: ShaderType + WriteInto + CreateFrom> GpuScalar<T> {
    /// Allocates a uniform buffer initialized with `value`.
    ///
    /// The value is laid out with the uniform address space rules of WGSL by `encase`.
    pub fn init<B: ComputeBackend + ?Sized>(backend: &mut B, value: T) -> ComputeResult<Self> {
        let buffer = backend.allocate(T::min_size().get(), BufferKind::Uniform)?;
        let result = Self {
            buffer,
            phantom: PhantomData,
        };
        result.write(backend, value)?;
        Ok(result)
    }

    /// Overwrites the value.
    pub fn write<B: ComputeBackend + ?Sized>(&self, backend: &mut B, value: T) -> ComputeResult<()> {
        let mut bytes = UniformBuffer::new(Vec::<u8>::new());
        bytes
            .write(&value)
            .map_err(|e| ComputeError::encoding("scalar write", e))?;
        backend.upload(self.buffer, &bytes.into_inner())
    }

    /// Reads the value back.
    pub fn read<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> ComputeResult<T> {
        let bytes = backend.download(self.buffer, T::min_size().get())?;
        UniformBuffer::new(bytes)
            .create()
            .map_err(|e| ComputeError::encoding("scalar read", e))
    }

    /// Frees the underlying buffer.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) -> ComputeResult<()> {
        backend.release(self.buffer)
    }
}

impl<T> GpuScalar<T> {
    /// The handle of the underlying buffer.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }
}
