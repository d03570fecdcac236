// vole-accel — the reference accelerator backend
//
// An in-process emulated device implementing the vole-core device
// contract. Storage is pitched the way texture subresources are (rows
// padded to 256 bytes for rank 2/3), kernels are per-(op, rank) variants
// executed lane by lane over a real work-group grid, and the kernel cache
// lives in the context. Everything a GPU backend would get wrong —
// pitch handling, group rounding, cross-context staging, missing kernel
// variants — is exercised here without hardware.
//
// USAGE:
//   let ctx = EmuDevice::context(0);
//   let t = Tensor::accel(&ctx, &[4, 3])?;

pub mod buffer;
mod kernel;

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use vole_core::error::{Error, Result};
use vole_core::{ApplierSet, Context, DeviceBuffer, DeviceContext, Kernel, KernelOp};

pub use buffer::{PitchedBuffer, ROW_ALIGN};
use kernel::EmuKernel;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// An emulated device context: allocator plus lazily-populated kernel
/// cache. Two `EmuDevice` instances are distinct physical contexts even
/// with the same ordinal; copies between them stage through the host.
#[derive(Debug)]
pub struct EmuDevice {
    id: usize,
    ordinal: usize,
    appliers: ApplierSet,
}

impl EmuDevice {
    pub fn new(ordinal: usize) -> Rc<EmuDevice> {
        Rc::new(EmuDevice {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            ordinal,
            appliers: ApplierSet::new(),
        })
    }

    /// Convenience: a fresh context handle, ready for `Tensor::accel`.
    pub fn context(ordinal: usize) -> Context {
        Self::new(ordinal)
    }
}

impl DeviceContext for EmuDevice {
    fn name(&self) -> String {
        format!("emu:{}", self.ordinal)
    }

    fn id(&self) -> usize {
        self.id
    }

    fn alloc(&self, dims: &[usize]) -> Result<Box<dyn DeviceBuffer>> {
        Ok(Box::new(PitchedBuffer::new(self.id, dims)?))
    }

    fn alloc_from(&self, dims: &[usize], data: &[f32]) -> Result<Box<dyn DeviceBuffer>> {
        Ok(Box::new(PitchedBuffer::from_data(self.id, dims, data)?))
    }

    fn create_kernel(&self, op: KernelOp, rank: usize) -> Result<Rc<dyn Kernel>> {
        let supported = match op {
            KernelOp::DenseForward | KernelOp::DenseBackward => rank == 1,
            KernelOp::DenseGrad => rank == 2,
            _ => (1..=3).contains(&rank),
        };
        if !supported {
            return Err(Error::KernelVariantMissing { op, rank });
        }
        debug!("{}: building kernel variant {:?}/rank{}", self.name(), op, rank);
        Ok(Rc::new(EmuKernel::new(op, rank)))
    }

    fn appliers(&self) -> &ApplierSet {
        &self.appliers
    }
}
