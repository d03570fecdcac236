use crate::backend::KernelOp;
use crate::tensor::Backend;

/// All errors that can occur within vole.
///
/// One enum captures every failure mode: shape and length mismatches,
/// unsupported ranks, out-of-bounds region copies, backend/context mixing,
/// lifecycle violations and missing kernel variants. Using a single error
/// type across the workspace simplifies propagation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g. copying [2,3] into [4,5]).
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Element count mismatch (same-backend full copies, raw updates).
    #[error("length mismatch: expected {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// Tensors are rank 1 to 3; anything else is a configuration error.
    #[error("rank {rank} is not supported (tensors are rank 1-3)")]
    RankUnsupported { rank: usize },

    /// A region copy addressed elements outside a tensor's extents.
    #[error("region out of bounds: start {start:?}, count {count:?} against dims {dims:?}")]
    RegionOutOfBounds {
        start: [usize; 3],
        count: [usize; 3],
        dims: Vec<usize>,
    },

    /// An operation required tensors on one backend but got a mix.
    #[error("backend mismatch: expected {expected:?}, got {got:?}")]
    BackendMismatch { expected: Backend, got: Backend },

    /// Accelerator tensors from different device contexts in one dispatch.
    #[error("tensors belong to different device contexts")]
    ContextMismatch,

    /// The device has no kernel variant for this operation/rank pair.
    /// Fatal: dispatch never falls back to the host.
    #[error("no kernel variant for {op:?} at rank {rank}")]
    KernelVariantMissing { op: KernelOp, rank: usize },

    /// A parameter was used where a gradient companion is required.
    #[error("tensor has no gradient companion")]
    MissingGradient,

    /// Training-only state was touched outside the prepared lifecycle stage.
    #[error("training is not prepared: {0}")]
    NotPrepared(&'static str),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
