//! Container runtime integration
//!
//! MRIQC is launched through a container runtime CLI (`docker run` by
//! default). The `AnalysisRunner` trait is the seam the pipeline drives, so
//! the runtime can be swapped out in tests.

mod runner;

pub use runner::{
    AnalysisRunner, DockerRunner, MriqcInvocation, RunOutcome, RunnerError, CONTAINER_INPUT,
    CONTAINER_OUTPUT,
};

#[cfg(test)]
pub use runner::MockAnalysisRunner;
