//! WGSL composition on top of `naga_oil`.
//!
//! Kernels are written as WGSL entry points importing composable modules (files starting with
//! `#define_import_path`). Constants shared with Rust are injected as shader defs and read with
//! the `#{NAME}` syntax, so their value is only ever written on the Rust side.

use crate::error::{ComputeError, ComputeResult};
use crate::kernel::Kernel;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga_oil::compose::{
    ComposableModuleDescriptor, Composer, ComposerError, NagaModuleDescriptor, ShaderDefValue,
};
use std::collections::HashMap;

/// Shader defs of a kernel, by name.
pub type ShaderDefs = HashMap<String, ShaderDefValue>;

/// The path declared by the `#define_import_path` directive of a composable module.
pub fn import_path(src: &str) -> Option<&str> {
    src.lines()
        .find_map(|line| line.trim().strip_prefix("#define_import_path"))
        .map(|path| path.trim().trim_end_matches(';').trim())
}

/// Extensions of the `naga_oil` [`Composer`].
pub trait ComposerExt {
    /// Adds a composable module, unless a module with the same import path is already there.
    ///
    /// `naga_oil` stops resolving some symbols when a module is added twice, which happens as
    /// soon as two kernels compiled by the same composer share an import.
    fn add_composable_module_once(
        &mut self,
        src: &'static str,
        shader_defs: &ShaderDefs,
    ) -> Result<bool, ComposerError>;

    /// Composes the WGSL of `kernel` with the modules it imports.
    fn make_kernel_module(&mut self, kernel: &dyn Kernel) -> Result<naga::Module, ComposerError>;
}

impl ComposerExt for Composer {
    fn add_composable_module_once(
        &mut self,
        src: &'static str,
        shader_defs: &ShaderDefs,
    ) -> Result<bool, ComposerError> {
        let path = import_path(src);
        if path.is_some_and(|path| self.contains_module(path)) {
            return Ok(false);
        }

        self.add_composable_module(ComposableModuleDescriptor {
            source: src,
            file_path: path.unwrap_or("<anonymous module>"),
            shader_defs: shader_defs.clone(),
            ..Default::default()
        })?;
        Ok(true)
    }

    fn make_kernel_module(&mut self, kernel: &dyn Kernel) -> Result<naga::Module, ComposerError> {
        let shader_defs = kernel.shader_defs();
        for module in kernel.modules() {
            self.add_composable_module_once(module, &shader_defs)?;
        }

        self.make_naga_module(NagaModuleDescriptor {
            source: kernel.wgsl(),
            file_path: kernel.name(),
            shader_defs,
            ..Default::default()
        })
    }
}

/// Composes `kernel` with a fresh composer and runs the `naga` validator on the result.
///
/// This catches WGSL errors without a device.
pub fn check_kernel(kernel: &dyn Kernel) -> ComputeResult<()> {
    let module = Composer::default()
        .make_kernel_module(kernel)
        .map_err(|e| ComputeError::compose(kernel.name(), e))?;
    Validator::new(ValidationFlags::all(), Capabilities::default())
        .validate(&module)
        .map_err(|e| ComputeError::Compose {
            kernel: kernel.name(),
            reason: e.into_inner().to_string(),
        })?;
    Ok(())
}
