//! Status management utilities.
//!
//! Tracks the last persisted status of a declared resource so that a tick
//! only writes the status subresource when something actually changed.

/// Copy of the status as last seen on the cluster.
#[derive(Clone, Debug)]
pub struct StatusSnapshot<S> {
    persisted: S,
}

impl<S: Clone + PartialEq> StatusSnapshot<S> {
    /// Take a snapshot at tick start.
    pub fn new(status: &S) -> Self {
        Self {
            persisted: status.clone(),
        }
    }

    /// Whether `current` differs from what was last persisted.
    pub fn is_dirty(&self, current: &S) -> bool {
        self.persisted != *current
    }

    /// Record that `current` has been written.
    pub fn mark_persisted(&mut self, current: &S) {
        self.persisted = current.clone();
    }

    pub fn persisted(&self) -> &S {
        &self.persisted
    }
}
