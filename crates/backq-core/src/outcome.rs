use serde::{Deserialize, Serialize};

/// Verdict a worker hands back to the runtime for a leased job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkOutcome {
    /// Processed; the broker deletes the job
    Commit,
    /// Not processed; the broker releases the job for another attempt
    Fail,
    /// Leave the job untouched, a later lease picks it up again
    Defer,
}

impl WorkOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOutcome::Commit => "commit",
            WorkOutcome::Fail => "fail",
            WorkOutcome::Defer => "defer",
        }
    }
}
