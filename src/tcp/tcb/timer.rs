use tokio::time::Instant;

/// A single-shot deadline. The owner polls it with [`Timer::fire`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Arms the timer, replacing any earlier deadline.
    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms the timer and returns true if its deadline is at or before
    /// `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
