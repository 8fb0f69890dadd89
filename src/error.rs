use std::error;
use std::fmt;

/// A recoverable error raised by the topology core.
///
/// Configuration, invariant, and protocol failures are all modeled as one
/// error type; callers are free to match on the variant and recover.
/// Communication failures are not represented here: they are treated as
/// fatal and unwind the process via `panic!` instead.
#[derive(Debug)]
pub enum RuntimeError {
    /// A neighbor descriptor refers to a patch id that no rank owns.
    UnknownNeighbor { id: i64 },
    /// A typed neighbor accessor (`getNormalNbrInfo`, ...) was called on a
    /// slot holding a different `NbrType`.
    WrongNeighborVariant { expected: &'static str, found: &'static str },
    /// A coordinate or index fell outside the range a debug build checks.
    IndexOutOfRange { what: &'static str, index: i64 },
    /// The Schur `PatchSolverWrapper` requires cube-shaped patches.
    NonCubePatch,
    /// A multigrid-style helper requires an even patch size.
    OddPatchSize { axis: usize, n: usize },
    /// A domain id was registered twice (e.g. in a timer or generator).
    DuplicateDomainId { id: usize },
    /// Messages arrived or were acknowledged out of the expected order
    /// (e.g. nested timings stopped out of order).
    Protocol(String),
    /// A `serialize`/`deserialize` or JSON round trip encountered data
    /// that does not match the expected schema.
    Malformed(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RuntimeError::*;
        match self {
            UnknownNeighbor { id } => write!(f, "neighbor id {} is owned by no rank", id),
            WrongNeighborVariant { expected, found } => {
                write!(f, "expected {} neighbor info, found {}", expected, found)
            }
            IndexOutOfRange { what, index } => write!(f, "{} index {} out of range", what, index),
            NonCubePatch => write!(f, "patch is not cube-shaped (ns differs by axis)"),
            OddPatchSize { axis, n } => {
                write!(f, "patch size on axis {} is {}, expected an even number", axis, n)
            }
            DuplicateDomainId { id } => write!(f, "domain id {} already registered", id),
            Protocol(msg) => write!(f, "protocol error: {}", msg),
            Malformed(msg) => write!(f, "malformed data: {}", msg),
        }
    }
}

impl error::Error for RuntimeError {}

pub type Result<T> = std::result::Result<T, RuntimeError>;
