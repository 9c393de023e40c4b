//! Device backends.
//!
//! The scheduler talks to a device through the [`Device`] trait: compile a
//! kernel source, dispatch 1-D launches over slabs of device memory, and
//! move bytes between host and device. The in-tree [`host::HostDevice`]
//! executes kernels on the CPU by parsing the exact dialect
//! [`kernel::KernelCodegen`] emits; a GPU device plugs in behind the same
//! trait.

pub mod host;
pub mod kernel;

/// A compiled kernel, owned by the device that compiled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// A device-side memory allocation, owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBufferId(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("kernel build failed:\n{log}")]
    Build { log: String },
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),
}

pub trait Device {
    fn name(&self) -> &str;

    /// Compile kernel source into an executable program. On failure the
    /// error carries the device's build log.
    fn compile(&mut self, source: &str) -> Result<ProgramId, DeviceError>;

    /// Run a 1-D launch of `global_size` work items. `args` binds one buffer
    /// per kernel parameter, in parameter order. Blocks until completion.
    fn dispatch(
        &mut self,
        program: ProgramId,
        global_size: usize,
        args: &[DeviceBufferId],
    ) -> Result<(), DeviceError>;

    fn alloc(&mut self, bytes: usize) -> DeviceBufferId;

    fn free(&mut self, buffer: DeviceBufferId);

    /// Blocking write of `data` at `offset` bytes into `buffer`.
    fn write(&mut self, buffer: DeviceBufferId, offset: usize, data: &[u8]);

    /// Blocking read of `dst.len()` bytes at `offset` from `buffer`.
    fn read(&self, buffer: DeviceBufferId, offset: usize, dst: &mut [u8]);
}
