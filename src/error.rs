/// Error types for the verifier.
///
/// Only configuration and structural problems are errors. Races and barrier
/// findings are the verifier's product and live in the report instead.
use std::path::PathBuf;

use thiserror::Error;

use crate::kernel::Dim3;
use crate::report::ExitStatus;

#[derive(Error, Debug)]
pub enum VerifyError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    /// No input file was named
    #[error("no PTX file name was given")]
    NoFile,

    #[error("unable to open file {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither the source nor the caller provided a block shape
    #[error("no thread count: pass --threads or declare .maxntid in the kernel")]
    NoThreadCount,

    #[error("invalid thread count '{0}': expected N, XxY or XxYxZ with non-zero sizes")]
    InvalidThreadCount(String),

    // ------------------------------------------------------------------
    // Structural
    // ------------------------------------------------------------------
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("no .entry kernel found")]
    NoKernel,

    /// Only one entry kernel per file is supported
    #[error("line {line}: found a second .entry kernel; only one kernel per file is supported")]
    MultipleKernels { line: usize },

    #[error("declared thread block {declared} does not agree with supplied {supplied}")]
    ThreadCountMismatch { declared: Dim3, supplied: Dim3 },

    #[error("line {line}: branch to unknown label '{label}'")]
    UnknownLabel { line: usize, label: String },

    #[error(
        "barrier {name} generation {generation}: {arrivals} arrivals exceed the {expected} declared participants"
    )]
    TooManyParticipants {
        name: u32,
        generation: u32,
        arrivals: usize,
        expected: usize,
    },

    #[error("barrier name {name} is out of range (at most {max} named barriers)")]
    BarrierNameOutOfRange { name: i64, max: usize },

    /// A thread never reached the end of the kernel
    #[error("thread {thread} exceeded {limit} emulated instructions")]
    StepLimitExceeded { thread: usize, limit: u64 },

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------
    /// A task panicked or an invariant broke; the run cannot continue
    #[error("internal error: {0}")]
    Internal(String),
}

impl VerifyError {
    /// Map an error onto the process exit status the CLI reports.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            VerifyError::NoFile
            | VerifyError::FileOpen { .. }
            | VerifyError::NoThreadCount
            | VerifyError::InvalidThreadCount(_) => ExitStatus::Usage,
            VerifyError::Parse { .. }
            | VerifyError::NoKernel
            | VerifyError::MultipleKernels { .. }
            | VerifyError::ThreadCountMismatch { .. }
            | VerifyError::UnknownLabel { .. }
            | VerifyError::TooManyParticipants { .. }
            | VerifyError::BarrierNameOutOfRange { .. }
            | VerifyError::StepLimitExceeded { .. } => ExitStatus::Structural,
            VerifyError::Internal(_) => ExitStatus::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;
