// vole-core — dual-backend tensors and the accelerator contract
//
// This crate is the foundation of the vole training engine:
//
// - `tensor`: rank-1..3 buffers with a per-tensor backend (host or
//   accelerator) fixed at construction, optional gradient companions,
//   and the four-way full/region copy dispatch.
// - `region`: the axis-aligned sub-box descriptor and the flat row-by-row
//   copy routine every backend path reuses.
// - `backend`: the behavioral contract an accelerator must satisfy
//   (context, buffer, kernel), without prescribing an API or kernel
//   language.
// - `apply`: the rank-dispatching kernel applier and the per-context
//   applier cache.
// - `ops`: elementwise operations (host loops, accelerator dispatches).
//
// Execution is single-threaded and synchronous from the caller's point of
// view; reading accelerator data back to the host is a synchronization
// point.

pub mod apply;
pub mod backend;
pub mod error;
pub mod ops;
pub mod region;
pub mod tensor;

pub use apply::{ApplierSet, KernelApplier};
pub use backend::{ActKind, Context, DeviceBuffer, DeviceContext, Kernel, KernelOp, ParamBlock};
pub use error::{Error, Result};
pub use region::Region;
pub use tensor::{Backend, Tensor};
