// Tensor — a rank-1..3 buffer on a fixed backend, with region copies
//
// A Tensor is a cheap-clone handle (Rc inner). The component that created
// it remains its logical owner; handle sharing exists so that units can
// expose ports and collect parameter references without copying data.
// Storage sits behind a RefCell so forward/backward passes can mutate
// through shared handles; the engine is single-threaded by contract.
//
// The backend is fixed at construction. Converting backends means creating
// a new tensor and copying; the four copy paths (host-host, host-device,
// device-host, device-device) are dispatched in copy_to/copy_region_to.
// Region copies are the riskiest routine in the engine: a stride or pitch
// slip shears the copied block instead of crashing, which is why every
// path funnels through the row-by-row routines in `region`.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::backend::{Context, DeviceBuffer};
use crate::error::{Error, Result};
use crate::region::{copy_flat_region, Region};

/// Where a tensor's storage lives. Fixed for the tensor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Host,
    Accelerator,
}

/// The actual storage behind a tensor.
#[derive(Debug)]
pub(crate) enum Storage {
    Host(Vec<f32>),
    Accel(Box<dyn DeviceBuffer>),
}

#[derive(Debug)]
struct TensorInner {
    dims: Vec<usize>,
    len: usize,
    ctx: Option<Context>,
    storage: RefCell<Storage>,
    gradient: RefCell<Option<Tensor>>,
    update_in_place: Cell<bool>,
}

/// A rank-1..3 floating-point buffer with a fixed backend and an optional
/// same-shape gradient companion.
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

fn check_dims(dims: &[usize]) -> Result<usize> {
    if dims.is_empty() || dims.len() > 3 {
        return Err(Error::RankUnsupported { rank: dims.len() });
    }
    if dims.iter().any(|&d| d == 0) {
        return Err(Error::msg(format!("zero-sized dimension in {dims:?}")));
    }
    Ok(dims.iter().product())
}

impl Tensor {
    // ── Construction ─────────────────────────────────────────────────────

    /// A zero-filled host tensor.
    pub fn host(dims: &[usize]) -> Result<Tensor> {
        let len = check_dims(dims)?;
        Ok(Self::from_parts(dims, len, None, Storage::Host(vec![0.0; len])))
    }

    /// A host tensor taking ownership of `data`.
    pub fn host_from(dims: &[usize], data: Vec<f32>) -> Result<Tensor> {
        let len = check_dims(dims)?;
        if data.len() != len {
            return Err(Error::LengthMismatch {
                expected: len,
                got: data.len(),
            });
        }
        Ok(Self::from_parts(dims, len, None, Storage::Host(data)))
    }

    /// A zero-filled accelerator tensor on the given context.
    pub fn accel(ctx: &Context, dims: &[usize]) -> Result<Tensor> {
        let len = check_dims(dims)?;
        let buf = ctx.alloc(dims)?;
        Ok(Self::from_parts(dims, len, Some(Rc::clone(ctx)), Storage::Accel(buf)))
    }

    /// An accelerator tensor initialized from a tight host slice.
    pub fn accel_from(ctx: &Context, dims: &[usize], data: &[f32]) -> Result<Tensor> {
        let len = check_dims(dims)?;
        if data.len() != len {
            return Err(Error::LengthMismatch {
                expected: len,
                got: data.len(),
            });
        }
        let buf = ctx.alloc_from(dims, data)?;
        Ok(Self::from_parts(dims, len, Some(Rc::clone(ctx)), Storage::Accel(buf)))
    }

    fn from_parts(dims: &[usize], len: usize, ctx: Option<Context>, storage: Storage) -> Tensor {
        Tensor {
            inner: Rc::new(TensorInner {
                dims: dims.to_vec(),
                len,
                ctx,
                storage: RefCell::new(storage),
                gradient: RefCell::new(None),
                update_in_place: Cell::new(false),
            }),
        }
    }

    /// A new zero-filled tensor with this tensor's dims, backend and
    /// context.
    pub fn empty_clone(&self) -> Result<Tensor> {
        match &self.inner.ctx {
            None => Tensor::host(&self.inner.dims),
            Some(ctx) => Tensor::accel(ctx, &self.inner.dims),
        }
    }

    // ── Shape and identity ───────────────────────────────────────────────

    pub fn dims(&self) -> &[usize] {
        &self.inner.dims
    }

    pub fn rank(&self) -> usize {
        self.inner.dims.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn backend(&self) -> Backend {
        if self.inner.ctx.is_some() {
            Backend::Accelerator
        } else {
            Backend::Host
        }
    }

    pub fn context(&self) -> Option<Context> {
        self.inner.ctx.clone()
    }

    /// Whether two handles point at the same logical tensor.
    pub fn same_tensor(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether two tensors live on the same device context (false when
    /// either is host-backed).
    pub fn same_context(&self, other: &Tensor) -> bool {
        match (&self.inner.ctx, &other.inner.ctx) {
            (Some(a), Some(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    pub fn same_dims(&self, other: &Tensor) -> bool {
        self.inner.dims == other.inner.dims
    }

    // ── Gradient companion ───────────────────────────────────────────────

    /// Create the gradient companion (same dims, same backend, zeroed).
    /// No-op if one already exists.
    pub fn create_gradient(&self) -> Result<()> {
        let mut slot = self.inner.gradient.borrow_mut();
        if slot.is_none() {
            *slot = Some(self.empty_clone()?);
        }
        Ok(())
    }

    /// Drop the gradient companion, releasing its storage.
    pub fn dispose_gradient(&self) {
        *self.inner.gradient.borrow_mut() = None;
    }

    pub fn has_gradient(&self) -> bool {
        self.inner.gradient.borrow().is_some()
    }

    /// Handle to the gradient companion, if present.
    pub fn gradient(&self) -> Option<Tensor> {
        self.inner.gradient.borrow().clone()
    }

    /// Like `gradient` but an error when absent; for update rules.
    pub fn gradient_required(&self) -> Result<Tensor> {
        self.gradient().ok_or(Error::MissingGradient)
    }

    // ── Host access ──────────────────────────────────────────────────────

    /// Read the tensor back as a tight host vector. On the accelerator
    /// backend this is a synchronization point.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        match &*self.inner.storage.borrow() {
            Storage::Host(v) => Ok(v.clone()),
            Storage::Accel(buf) => buf.read(),
        }
    }

    /// Borrow host storage read-only. Errors on the accelerator backend.
    pub fn map_host<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        match &*self.inner.storage.borrow() {
            Storage::Host(v) => Ok(f(v)),
            Storage::Accel(_) => Err(Error::BackendMismatch {
                expected: Backend::Host,
                got: Backend::Accelerator,
            }),
        }
    }

    /// Borrow host storage mutably. Errors on the accelerator backend.
    pub fn map_host_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        match &mut *self.inner.storage.borrow_mut() {
            Storage::Host(v) => Ok(f(v)),
            Storage::Accel(_) => Err(Error::BackendMismatch {
                expected: Backend::Host,
                got: Backend::Accelerator,
            }),
        }
    }

    // ── Raw updates ──────────────────────────────────────────────────────

    /// Overwrite the whole tensor from a tight host slice.
    ///
    /// On the accelerator backend the default policy destroys and
    /// recreates the device resource; `set_update_in_place(true)` opts in
    /// to reusing it. The two differ when the resource is aliased.
    pub fn update_raw_data(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.inner.len {
            return Err(Error::LengthMismatch {
                expected: self.inner.len,
                got: data.len(),
            });
        }
        match &mut *self.inner.storage.borrow_mut() {
            Storage::Host(v) => {
                v.copy_from_slice(data);
                Ok(())
            }
            Storage::Accel(buf) => {
                if self.inner.update_in_place.get() {
                    buf.write_in_place(data)
                } else {
                    buf.write(data)
                }
            }
        }
    }

    /// Opt in to (or out of) in-place raw updates of the device resource.
    pub fn set_update_in_place(&self, in_place: bool) {
        self.inner.update_in_place.set(in_place);
    }

    // ── Full copies ──────────────────────────────────────────────────────

    /// Full-buffer copy into `dst`.
    ///
    /// Same-backend copies require equal element counts; cross-backend
    /// copies require equal dims. Host/device traffic stages through a
    /// tight host snapshot; device-to-device uses the native copy when the
    /// contexts match, else staging.
    pub fn copy_to(&self, dst: &Tensor) -> Result<()> {
        if self.same_tensor(dst) {
            return Ok(());
        }
        match (self.backend(), dst.backend()) {
            (Backend::Host, Backend::Host) => {
                if self.inner.len != dst.inner.len {
                    return Err(Error::LengthMismatch {
                        expected: dst.inner.len,
                        got: self.inner.len,
                    });
                }
                let src = self.inner.storage.borrow();
                let mut out = dst.inner.storage.borrow_mut();
                match (&*src, &mut *out) {
                    (Storage::Host(s), Storage::Host(d)) => d.copy_from_slice(s),
                    _ => unreachable!("backend checked above"),
                }
                Ok(())
            }
            (_, _) if !self.same_dims(dst) => Err(Error::ShapeMismatch {
                expected: dst.inner.dims.clone(),
                got: self.inner.dims.clone(),
            }),
            (Backend::Accelerator, Backend::Accelerator) if self.same_context(dst) => {
                let src = self.inner.storage.borrow();
                let mut out = dst.inner.storage.borrow_mut();
                match (&*src, &mut *out) {
                    (Storage::Accel(s), Storage::Accel(d)) => {
                        s.copy_region_to(d.as_mut(), &Region::full(&self.inner.dims), [0, 0, 0])
                    }
                    _ => unreachable!("backend checked above"),
                }
            }
            // Host->device, device->host and cross-context device copies
            // all stage through a tight snapshot.
            _ => {
                let snapshot = self.to_vec()?;
                dst.update_raw_data(&snapshot)
            }
        }
    }

    // ── Region copies ────────────────────────────────────────────────────

    /// Copy exactly the elements of `region` (source coordinates) into
    /// `dst` starting at `offset`. Destination elements outside the placed
    /// box are left untouched.
    pub fn copy_region_to(&self, dst: &Tensor, region: &Region, offset: [usize; 3]) -> Result<()> {
        region.check_within(&self.inner.dims)?;
        region.check_fits_at(offset, &dst.inner.dims)?;
        if self.same_tensor(dst) {
            return Err(Error::msg("region copy within one tensor is not supported"));
        }

        match (self.backend(), dst.backend()) {
            (Backend::Host, Backend::Host) => {
                let src = self.inner.storage.borrow();
                let mut out = dst.inner.storage.borrow_mut();
                match (&*src, &mut *out) {
                    (Storage::Host(s), Storage::Host(d)) => {
                        copy_flat_region(s, &self.inner.dims, d, &dst.inner.dims, region, offset);
                        Ok(())
                    }
                    _ => unreachable!("backend checked above"),
                }
            }
            (Backend::Host, Backend::Accelerator) => {
                let src = self.inner.storage.borrow();
                let mut out = dst.inner.storage.borrow_mut();
                match (&*src, &mut *out) {
                    (Storage::Host(s), Storage::Accel(d)) => {
                        d.write_region(s, &self.inner.dims, region, offset)
                    }
                    _ => unreachable!("backend checked above"),
                }
            }
            (Backend::Accelerator, Backend::Host) => {
                let snapshot = self.to_vec()?;
                dst.map_host_mut(|d| {
                    copy_flat_region(&snapshot, &self.inner.dims, d, dst.dims(), region, offset);
                })
            }
            (Backend::Accelerator, Backend::Accelerator) => {
                if self.same_context(dst) {
                    let src = self.inner.storage.borrow();
                    let mut out = dst.inner.storage.borrow_mut();
                    match (&*src, &mut *out) {
                        (Storage::Accel(s), Storage::Accel(d)) => {
                            s.copy_region_to(d.as_mut(), region, offset)
                        }
                        _ => unreachable!("backend checked above"),
                    }
                } else {
                    let snapshot = self.to_vec()?;
                    let src_dims = self.inner.dims.clone();
                    let mut out = dst.inner.storage.borrow_mut();
                    match &mut *out {
                        Storage::Accel(d) => d.write_region(&snapshot, &src_dims, region, offset),
                        _ => unreachable!("backend checked above"),
                    }
                }
            }
        }
    }

    // ── Crate-internal storage access (kernel dispatch) ──────────────────

    pub(crate) fn storage_ref(&self) -> Ref<'_, Storage> {
        self.inner.storage.borrow()
    }

    pub(crate) fn storage_mut(&self) -> RefMut<'_, Storage> {
        self.inner.storage.borrow_mut()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.inner.dims)
            .field("backend", &self.backend())
            .field("gradient", &self.has_gradient())
            .finish()
    }
}
