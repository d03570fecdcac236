// Kernel Applier — rank dispatch for accelerator elementwise work
//
// Every accelerator-side tensor operation goes through a KernelApplier: a
// small adapter that lazily materializes one of three per-rank kernel
// variants, fills the fixed parameter block with the dispatch extents, and
// issues exactly one dispatch sized ceil(extent / group) per axis.
//
// Appliers are cached per operation inside an ApplierSet owned by each
// device context, so kernel creation happens at most once per (context,
// op, rank) triple and no global mutable state is involved.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::{DeviceBuffer, DeviceContext, Kernel, KernelOp, ParamBlock};
use crate::error::{Error, Result};
use crate::region::padded;
use crate::tensor::{Backend, Storage, Tensor};

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Rank-dispatching adapter around up to three kernel variants of one
/// operation. Variants are created on first use and cached for the
/// applier's lifetime.
#[derive(Debug)]
pub struct KernelApplier {
    op: KernelOp,
    variants: RefCell<[Option<Rc<dyn Kernel>>; 3]>,
}

impl KernelApplier {
    pub fn new(op: KernelOp) -> Self {
        KernelApplier {
            op,
            variants: RefCell::new([None, None, None]),
        }
    }

    pub fn op(&self) -> KernelOp {
        self.op
    }

    /// Select the variant for `dims.len()`, creating it through the context
    /// on first use, then issue one dispatch over the dims' extents.
    ///
    /// `params.ints[0..3]` are overwritten with the extents; the remaining
    /// slots pass through to the kernel untouched.
    pub fn run(
        &self,
        ctx: &dyn DeviceContext,
        outs: &mut [&mut dyn DeviceBuffer],
        ins: &[&dyn DeviceBuffer],
        dims: &[usize],
        params: ParamBlock,
    ) -> Result<()> {
        let rank = dims.len();
        if rank == 0 || rank > 3 {
            return Err(Error::RankUnsupported { rank });
        }
        let kernel = {
            let mut slots = self.variants.borrow_mut();
            match &slots[rank - 1] {
                Some(k) => Rc::clone(k),
                None => {
                    let k = ctx.create_kernel(self.op, rank)?;
                    slots[rank - 1] = Some(Rc::clone(&k));
                    k
                }
            }
        };

        let ext = padded(dims);
        let group = kernel.group_size();
        let groups = [
            ceil_div(ext[0], group[0]),
            ceil_div(ext[1], group[1]),
            ceil_div(ext[2], group[2]),
        ];
        let mut params = params;
        for axis in 0..3 {
            params.ints[axis] = ext[axis] as i32;
        }
        kernel.dispatch(outs, ins, &params, groups)
    }
}

/// Per-context cache of appliers, keyed by operation.
///
/// Lazily populated and then treated as read-only. Not thread-safe by
/// design; a context is never shared across concurrent training loops.
#[derive(Debug, Default)]
pub struct ApplierSet {
    map: RefCell<HashMap<KernelOp, Rc<KernelApplier>>>,
}

impl ApplierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the applier for `op`, creating it on first use.
    pub fn get(&self, op: KernelOp) -> Rc<KernelApplier> {
        let mut map = self.map.borrow_mut();
        Rc::clone(
            map.entry(op)
                .or_insert_with(|| Rc::new(KernelApplier::new(op))),
        )
    }
}

/// Run a device kernel over accelerator tensors.
///
/// `outs` are written (and possibly read), `ins` are read-only. All tensors
/// must live on the same device context and every `out` must be distinct
/// from every other operand. `dims` sizes the dispatch; `params.ints[3]`
/// and the floats are forwarded to the kernel.
///
/// This is the only path from tensors to the device kernels; host tensors
/// are rejected rather than silently staged.
pub fn dispatch(
    op: KernelOp,
    outs: &[&Tensor],
    ins: &[&Tensor],
    dims: &[usize],
    params: ParamBlock,
) -> Result<()> {
    let first = outs
        .first()
        .ok_or_else(|| Error::msg("dispatch requires at least one output tensor"))?;
    let ctx = first
        .context()
        .ok_or(Error::BackendMismatch {
            expected: Backend::Accelerator,
            got: Backend::Host,
        })?;

    // Outputs are borrowed mutably below; aliased operands would abort at
    // runtime, so reject them up front.
    for (i, a) in outs.iter().enumerate() {
        for b in &outs[i + 1..] {
            if a.same_tensor(b) {
                return Err(Error::msg("dispatch operands alias the same tensor"));
            }
        }
        for b in ins {
            if a.same_tensor(b) {
                return Err(Error::msg("dispatch operands alias the same tensor"));
            }
        }
    }
    for t in outs.iter().chain(ins.iter()) {
        if t.backend() != Backend::Accelerator {
            return Err(Error::BackendMismatch {
                expected: Backend::Accelerator,
                got: Backend::Host,
            });
        }
        if !first.same_context(t) {
            return Err(Error::ContextMismatch);
        }
    }

    let mut out_guards: Vec<_> = outs.iter().map(|t| t.storage_mut()).collect();
    let in_guards: Vec<_> = ins.iter().map(|t| t.storage_ref()).collect();

    let mut out_bufs: Vec<&mut dyn DeviceBuffer> = Vec::with_capacity(out_guards.len());
    for guard in out_guards.iter_mut() {
        match &mut **guard {
            Storage::Accel(buf) => out_bufs.push(buf.as_mut()),
            Storage::Host(_) => unreachable!("backend checked above"),
        }
    }
    let mut in_bufs: Vec<&dyn DeviceBuffer> = Vec::with_capacity(in_guards.len());
    for guard in in_guards.iter() {
        match &**guard {
            Storage::Accel(buf) => in_bufs.push(buf.as_ref()),
            Storage::Host(_) => unreachable!("backend checked above"),
        }
    }

    let applier = ctx.appliers().get(op);
    applier.run(ctx.as_ref(), &mut out_bufs, &in_bufs, dims, params)
}
