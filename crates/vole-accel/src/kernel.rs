// EmuKernel — kernel variants executed lane by lane on the host
//
// Each variant is fixed to one (operation, rank) pair at creation, exactly
// like a compiled shader. Dispatch walks the work-group grid and discards
// lanes beyond the extents carried in the parameter block, so group
// rounding in the applier is genuinely exercised: a 20-element rank-1
// dispatch runs 2 groups of 16 and the last 12 lanes fall out of bounds.

use vole_core::error::{Error, Result};
use vole_core::{bail, DeviceBuffer, Kernel, KernelOp, ParamBlock};

use crate::buffer::PitchedBuffer;

#[derive(Debug)]
pub struct EmuKernel {
    op: KernelOp,
    rank: usize,
}

impl EmuKernel {
    pub(crate) fn new(op: KernelOp, rank: usize) -> Self {
        EmuKernel { op, rank }
    }
}

fn pitched<'a>(buf: &'a dyn DeviceBuffer) -> Result<&'a PitchedBuffer> {
    buf.as_any()
        .downcast_ref::<PitchedBuffer>()
        .ok_or_else(|| Error::msg("foreign buffer bound to an emulated kernel"))
}

fn pitched_mut<'a>(buf: &'a mut dyn DeviceBuffer) -> Result<&'a mut PitchedBuffer> {
    buf.as_any_mut()
        .downcast_mut::<PitchedBuffer>()
        .ok_or_else(|| Error::msg("foreign buffer bound to an emulated kernel"))
}

/// Walk every lane of the dispatch grid, skipping lanes past the extents.
fn for_each_lane(
    ext: [usize; 3],
    groups: [usize; 3],
    group: [usize; 3],
    mut body: impl FnMut(usize, usize, usize),
) {
    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                for lz in 0..group[2] {
                    for ly in 0..group[1] {
                        for lx in 0..group[0] {
                            let x = gx * group[0] + lx;
                            let y = gy * group[1] + ly;
                            let z = gz * group[2] + lz;
                            if x < ext[0] && y < ext[1] && z < ext[2] {
                                body(x, y, z);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn extents(params: &ParamBlock) -> [usize; 3] {
    [
        params.ints[0] as usize,
        params.ints[1] as usize,
        params.ints[2] as usize,
    ]
}

fn expect_operands(
    op: KernelOp,
    outs: &[&mut dyn DeviceBuffer],
    ins: &[&dyn DeviceBuffer],
    n_out: usize,
    n_in: usize,
) -> Result<()> {
    if outs.len() != n_out || ins.len() != n_in {
        bail!(
            "{op:?} expects {n_out} output / {n_in} input operands, got {}/{}",
            outs.len(),
            ins.len()
        );
    }
    Ok(())
}

impl Kernel for EmuKernel {
    fn group_size(&self) -> [usize; 3] {
        if self.rank == 1 {
            [16, 1, 1]
        } else {
            [8, 8, 1]
        }
    }

    fn dispatch(
        &self,
        outs: &mut [&mut dyn DeviceBuffer],
        ins: &[&dyn DeviceBuffer],
        params: &ParamBlock,
        groups: [usize; 3],
    ) -> Result<()> {
        let ext = extents(params);
        let group = self.group_size();
        match self.op {
            KernelOp::Zero => {
                expect_operands(self.op, outs, ins, 1, 0)?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| out.set(x, y, z, 0.0));
            }
            KernelOp::Add => {
                expect_operands(self.op, outs, ins, 1, 1)?;
                let src = pitched(ins[0])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    out.update(x, y, z, |v| v + src.get(x, y, z));
                });
            }
            KernelOp::Mul => {
                expect_operands(self.op, outs, ins, 1, 1)?;
                let src = pitched(ins[0])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    out.update(x, y, z, |v| v * src.get(x, y, z));
                });
            }
            KernelOp::Scale => {
                expect_operands(self.op, outs, ins, 1, 0)?;
                let factor = params.floats[0];
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    out.update(x, y, z, |v| v * factor);
                });
            }
            KernelOp::ScaledAdd => {
                expect_operands(self.op, outs, ins, 1, 1)?;
                let alpha = params.floats[0];
                let src = pitched(ins[0])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    out.update(x, y, z, |v| v + alpha * src.get(x, y, z));
                });
            }
            KernelOp::Activate(kind) => {
                expect_operands(self.op, outs, ins, 1, 0)?;
                let alpha = params.floats[0];
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    out.update(x, y, z, |v| kind.value(v, alpha));
                });
            }
            KernelOp::ActivateSlope(kind) => {
                expect_operands(self.op, outs, ins, 1, 1)?;
                let alpha = params.floats[0];
                let activated = pitched(ins[0])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    let slope = kind.slope_from_output(activated.get(x, y, z), alpha);
                    out.update(x, y, z, |v| v * slope);
                });
            }
            KernelOp::DenseForward => {
                // Rank-1 dispatch over the n outputs; ints[3] = m inputs.
                // Weight is [m, n]: x = input index, y = output index.
                expect_operands(self.op, outs, ins, 1, 3)?;
                let m = params.ints[3] as usize;
                let input = pitched(ins[0])?;
                let weight = pitched(ins[1])?;
                let bias = pitched(ins[2])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |j, _, _| {
                    let mut acc = bias.get(j, 0, 0);
                    for i in 0..m {
                        acc += input.get(i, 0, 0) * weight.get(i, j, 0);
                    }
                    out.set(j, 0, 0, acc);
                });
            }
            KernelOp::DenseBackward => {
                // Rank-1 dispatch over the m inputs; ints[3] = n outputs.
                expect_operands(self.op, outs, ins, 1, 2)?;
                let n = params.ints[3] as usize;
                let weight = pitched(ins[0])?;
                let der = pitched(ins[1])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |i, _, _| {
                    let mut acc = 0.0;
                    for j in 0..n {
                        acc += weight.get(i, j, 0) * der.get(j, 0, 0);
                    }
                    out.set(i, 0, 0, acc);
                });
            }
            KernelOp::DenseGrad => {
                // Rank-2 dispatch over [m, n]: accumulate the outer product
                // of the stored input and the post-slope derivative.
                expect_operands(self.op, outs, ins, 1, 2)?;
                let input = pitched(ins[0])?;
                let der = pitched(ins[1])?;
                let out = pitched_mut(&mut *outs[0])?;
                for_each_lane(ext, groups, group, |i, j, _| {
                    out.update(i, j, 0, |v| v + input.get(i, 0, 0) * der.get(j, 0, 0));
                });
            }
            KernelOp::AdamStep => {
                // floats = [lr, beta1, beta2, beta1_t, beta2_t, eps, _, _]
                expect_operands(self.op, outs, ins, 3, 1)?;
                let [lr, b1, b2, b1t, b2t, eps, ..] = params.floats;
                let grad = pitched(ins[0])?;
                let (param_s, rest) = outs.split_at_mut(1);
                let (m1_s, m2_s) = rest.split_at_mut(1);
                let param = pitched_mut(&mut *param_s[0])?;
                let m1 = pitched_mut(&mut *m1_s[0])?;
                let m2 = pitched_mut(&mut *m2_s[0])?;
                for_each_lane(ext, groups, group, |x, y, z| {
                    let g = grad.get(x, y, z);
                    let new_m1 = b1 * m1.get(x, y, z) + (1.0 - b1) * g;
                    let new_m2 = b2 * m2.get(x, y, z) + (1.0 - b2) * g * g;
                    m1.set(x, y, z, new_m1);
                    m2.set(x, y, z, new_m2);
                    let m_hat = new_m1 / (1.0 - b1t);
                    let v_hat = new_m2 / (1.0 - b2t);
                    param.update(x, y, z, |p| p - lr * m_hat / (v_hat.sqrt() + eps));
                });
            }
        }
        Ok(())
    }
}
