//! Jitter buffer state machine

/// Playout state of one session's jitter buffer
///
/// Transitions are validated so the tick task cannot resurrect a closed
/// buffer or start draining twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Accumulating: buffered audio is below the minimum hold, nothing is
    /// released yet.
    Filling,

    /// Releasing chunks whose hold has expired.
    Playing,

    /// Session is ending; the buffer empties and accepts no new chunks.
    Draining,

    /// Emptied and detached; terminal.
    Closed,
}

impl BufferState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &BufferState) -> bool {
        use BufferState::*;

        match (self, target) {
            // Buffered enough to start releasing
            (Filling, Playing) => true,
            // Underrun sends the buffer back to filling
            (Playing, Filling) => true,
            // Draining can begin from either live state
            (Filling, Draining) => true,
            (Playing, Draining) => true,
            (Draining, Closed) => true,

            // Closed is terminal
            (Closed, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, BufferState::Filling | BufferState::Playing)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, BufferState::Draining)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, BufferState::Closed)
    }
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferState::Filling => "Filling",
            BufferState::Playing => "Playing",
            BufferState::Draining => "Draining",
            BufferState::Closed => "Closed",
        };
        write!(f, "{}", name)
    }
}
