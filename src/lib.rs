pub mod config;
pub mod decode;
pub mod error;
pub mod graph;
pub mod happens;
pub mod interp;
pub mod kernel;
pub mod memory;
pub mod metrics;
pub mod program;
pub mod race;
pub mod report;
pub mod scheduler;
pub mod thread;
pub mod verifier;
pub mod warp;

pub use config::{VerifierConfig, WarpMode};
pub use error::{Result, VerifyError};
pub use kernel::Dim3;
pub use report::{ExitStatus, VerificationReport, Verdict};
pub use verifier::Verifier;
