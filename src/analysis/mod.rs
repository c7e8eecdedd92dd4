//! Module for the analyses over method bodies: the control flow graph,
//! the bytecode simplifier, liveness of locals, and the generic fixed
//! point driver.

pub mod cfg;
pub mod fixed_point;
pub mod liveness;
#[cfg(feature = "petgraph")]
pub mod petgraph;
pub mod simplify;

/// An error indicating that the shape of the analyzed code is broken:
/// a branch leads outside the instruction list, operand stacks of
/// incompatible depths meet, or the code array disagrees with its
/// advertised layout. This always signals invalid input, never an
/// analysis limitation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("inconsistent code shape: {0}")]
pub struct InconsistentCodeShape(pub String);
