use slotmap::new_key_type;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

new_key_type! {
    pub struct ParticleIndex;
    pub struct ContainerId;
    pub struct ScoreStateId;
    pub struct RestraintId;
    pub struct RestraintSetId;
    pub struct OptimizerStateId;
}

/// Process-unique identity of a [`Model`](crate::engine::Model).
///
/// Used to validate that a snapshot is only ever restored into the model it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

impl ModelId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}
