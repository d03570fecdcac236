// Device contract — abstraction over accelerator backends
//
// Host storage is a plain Vec<f32> inside the tensor. Accelerator storage
// is whatever the device context allocates behind the DeviceBuffer trait:
// the reference implementation uses pitched host memory, a real GPU backend
// would wrap buffers/textures. The engine only relies on the behavioral
// contract spelled out here.
//
// WHY TRAIT OBJECTS AND NOT A GENERIC PARAMETER?
//
// A tensor's backend is chosen at runtime, per tensor, and host and
// accelerator tensors are copied into each other freely. A compile-time
// backend parameter would force the whole network onto one backend, so the
// contract is expressed with trait objects instead.
//
// Execution is single-threaded by design. Per-context caches use interior
// mutability and are not thread-safe; sharing a context across concurrent
// training loops is out of scope.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::apply::ApplierSet;
use crate::error::Result;
use crate::region::Region;

/// Element-wise activation kinds understood by the kernel set.
///
/// The backward variant computes the slope from the *activated output*,
/// which every kind here permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActKind {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
}

impl ActKind {
    /// Forward value. `alpha` is the negative-side slope for LeakyRelu and
    /// ignored elsewhere.
    pub fn value(self, x: f32, alpha: f32) -> f32 {
        match self {
            ActKind::Identity => x,
            ActKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActKind::Tanh => x.tanh(),
            ActKind::Relu => x.max(0.0),
            ActKind::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
        }
    }

    /// Derivative expressed in terms of the activated output `y`, the form
    /// the backward pass multiplies into the derivative chain.
    pub fn slope_from_output(self, y: f32, alpha: f32) -> f32 {
        match self {
            ActKind::Identity => 1.0,
            ActKind::Sigmoid => y * (1.0 - y),
            ActKind::Tanh => 1.0 - y * y,
            ActKind::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActKind::LeakyRelu => {
                if y > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
        }
    }
}

/// The closed set of device kernel operations.
///
/// Every accelerator-side tensor operation in the engine is one of these;
/// there is no open-ended kernel registration. A device context must either
/// provide a variant for a requested (op, rank) pair or report a
/// configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    /// out[i] = 0
    Zero,
    /// out[i] += in0[i]
    Add,
    /// out[i] *= in0[i]
    Mul,
    /// out[i] *= floats[0]
    Scale,
    /// out[i] += floats[0] * in0[i]
    ScaledAdd,
    /// out[i] = act(out[i]), in place
    Activate(ActKind),
    /// out[i] *= slope(in0[i]) where in0 is the activated output
    ActivateSlope(ActKind),
    /// out[j] = in2[j] + sum_i in0[i] * in1[i + j*m], m = ints[3]
    DenseForward,
    /// out[i] = sum_j in0[i + j*m] * in1[j], n = ints[3] outputs
    DenseBackward,
    /// out[(i,j)] += in0[i] * in1[j] (weight-gradient outer product)
    DenseGrad,
    /// Adam moment update + parameter step; see `ParamBlock` float layout.
    AdamStep,
}

/// Small fixed-size parameter block bound alongside the operands of a
/// dispatch, mirroring a constant buffer.
///
/// `ints[0..3]` always carry the dispatch extents (set by the applier);
/// `ints[3]` and the floats are operation-specific. For `AdamStep` the
/// floats are `[lr, beta1, beta2, beta1_t, beta2_t, eps, 0, 0]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamBlock {
    pub ints: [i32; 4],
    pub floats: [f32; 8],
}

impl ParamBlock {
    pub fn with_float(mut self, slot: usize, value: f32) -> Self {
        self.floats[slot] = value;
        self
    }

    pub fn with_int(mut self, slot: usize, value: i32) -> Self {
        self.ints[slot] = value;
        self
    }
}

/// One compiled kernel variant for a fixed (operation, rank) pair.
pub trait Kernel: fmt::Debug {
    /// Work-group extents per axis, fixed by the variant (16 along the only
    /// axis at rank 1, 8x8 at rank 2/3).
    fn group_size(&self) -> [usize; 3];

    /// Bind operands and parameters, then issue one dispatch of
    /// `groups[0] * groups[1] * groups[2]` work groups. Lanes beyond the
    /// extents in `params.ints` must be discarded by the kernel body.
    ///
    /// Binding and dispatch happen in strict order and never concurrently
    /// against one context; the call returns only once the effect is
    /// logically committed.
    fn dispatch(
        &self,
        outs: &mut [&mut dyn DeviceBuffer],
        ins: &[&dyn DeviceBuffer],
        params: &ParamBlock,
        groups: [usize; 3],
    ) -> Result<()>;
}

/// An accelerator-resident storage allocation for one tensor.
///
/// Rank-1 buffers are flat; rank-2/3 buffers may carry row/slice pitch
/// padding, which `read`/`write` and the region routines must hide from
/// the caller: a snapshot is always the tight `product(dims)` elements.
pub trait DeviceBuffer: fmt::Debug {
    fn dims(&self) -> &[usize];

    /// Identifies the owning context; buffers from different contexts can
    /// only exchange data through a host staging snapshot.
    fn context_id(&self) -> usize;

    /// Synchronize and read the full buffer back as a tight host vector.
    fn read(&self) -> Result<Vec<f32>>;

    /// Full overwrite, destroying and recreating the underlying device
    /// resource. This is the default update policy for rank >= 2 buffers.
    fn write(&mut self, data: &[f32]) -> Result<()>;

    /// Full overwrite reusing the existing resource. Opt-in optimization;
    /// not equivalent to `write` when the resource is aliased elsewhere.
    fn write_in_place(&mut self, data: &[f32]) -> Result<()>;

    /// Copy `region` out of a tight host snapshot (`src`, shaped
    /// `src_dims`) into this buffer at `offset`, honoring pitch.
    fn write_region(
        &mut self,
        src: &[f32],
        src_dims: &[usize],
        region: &Region,
        offset: [usize; 3],
    ) -> Result<()>;

    /// Native device-to-device region copy. Only valid when `dst` belongs
    /// to the same context; the engine falls back to host staging
    /// otherwise.
    fn copy_region_to(
        &self,
        dst: &mut dyn DeviceBuffer,
        region: &Region,
        offset: [usize; 3],
    ) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A physical device context: allocator plus per-context kernel cache.
///
/// The applier cache is owned by the context (no process-wide statics) and
/// is lazily populated, then effectively read-only.
pub trait DeviceContext: fmt::Debug {
    /// Human-readable device name (e.g. "emu:0").
    fn name(&self) -> String;

    /// Unique id of this live context instance.
    fn id(&self) -> usize;

    /// Allocate a zero-filled buffer for the given dims.
    fn alloc(&self, dims: &[usize]) -> Result<Box<dyn DeviceBuffer>>;

    /// Allocate a buffer initialized from a tight host slice.
    fn alloc_from(&self, dims: &[usize], data: &[f32]) -> Result<Box<dyn DeviceBuffer>>;

    /// Compile/build the kernel variant for (op, rank). Called at most once
    /// per applier and pair; rank without a variant is a fatal
    /// configuration error.
    fn create_kernel(&self, op: KernelOp, rank: usize) -> Result<Rc<dyn Kernel>>;

    /// The per-context applier cache.
    fn appliers(&self) -> &ApplierSet;
}

/// Shared handle to a device context.
pub type Context = Rc<dyn DeviceContext>;
