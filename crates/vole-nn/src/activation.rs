// Activation — elementwise nonlinearities for the dense unit
//
// A closed enum rather than a trait: the accelerator kernel set is closed,
// so open-ended activation implementations could not dispatch anyway. The
// backward form is a slope computed from the activated output, multiplied
// into the derivative chain.

use vole_core::ActKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    /// Negative-side slope.
    LeakyRelu(f32),
}

impl Activation {
    pub fn kind(&self) -> ActKind {
        match self {
            Activation::Identity => ActKind::Identity,
            Activation::Sigmoid => ActKind::Sigmoid,
            Activation::Tanh => ActKind::Tanh,
            Activation::Relu => ActKind::Relu,
            Activation::LeakyRelu(_) => ActKind::LeakyRelu,
        }
    }

    pub fn alpha(&self) -> f32 {
        match self {
            Activation::LeakyRelu(a) => *a,
            _ => 0.0,
        }
    }

    pub fn value(&self, x: f32) -> f32 {
        self.kind().value(x, self.alpha())
    }

    /// Derivative as a function of the activated output.
    pub fn slope_from_output(&self, y: f32) -> f32 {
        self.kind().slope_from_output(y, self.alpha())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_slope_matches_output_form() {
        let a = Activation::Sigmoid;
        let y = a.value(0.3);
        let eps = 1e-3;
        let numeric = (a.value(0.3 + eps) - a.value(0.3 - eps)) / (2.0 * eps);
        assert!((a.slope_from_output(y) - numeric).abs() < 1e-4);
    }

    #[test]
    fn leaky_relu_uses_alpha_below_zero() {
        let a = Activation::LeakyRelu(0.1);
        assert_eq!(a.value(-2.0), -0.2);
        assert_eq!(a.slope_from_output(a.value(-2.0)), 0.1);
        assert_eq!(a.slope_from_output(a.value(2.0)), 1.0);
    }
}
