pub mod audio;
pub mod codec;
pub mod screen;
pub mod video;

/// Result of a bounded device readiness probe. A probe never loops forever:
/// it either observes a working device, runs out of time, or fails outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    TimedOut,
    Failed(String),
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ProbeOutcome::Passed)
    }
}
