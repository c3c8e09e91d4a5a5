//! Node Lifecycle State Machine
//!
//! The agent moves through a small, totally ordered set of lifecycle
//! states. Every state carries a numeric rank and transitions are
//! strictly monotonic: a transition is legal only if the target rank is
//! greater than the current rank.
//!
//! ```text
//! ┌──────┐        ┌─────────┐        ┌──────────┐
//! │ Init │───────▶│ Running │───────▶│ Shutdown │
//! └──────┘        └─────────┘        └──────────┘
//!   rank 1           rank 2             rank 3 (terminal)
//! ```
//!
//! ## Invariants
//!
//! - `Init` is the only initial state, `Shutdown` the only terminal state.
//! - `next()` advances by exactly one rank and saturates at `Shutdown`.
//! - `is_transition_allowed(to)` holds iff `to.rank() > self.rank()`.
//! - Forcing `Shutdown` is always permitted; that bypass lives in the
//!   execution context, not here. This type only encodes the strict rule.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of the node control-plane agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycleState {
    /// Agent constructed, main loop not yet running.
    Init,
    /// Heartbeat loop and command processing active.
    Running,
    /// Terminal state. Once reached, the agent never leaves it.
    Shutdown,
}

impl NodeLifecycleState {
    /// The only state an agent may start in.
    pub fn initial() -> Self {
        NodeLifecycleState::Init
    }

    /// The only terminal state.
    pub fn terminal() -> Self {
        NodeLifecycleState::Shutdown
    }

    /// Numeric rank. Transitions must strictly increase this value.
    pub fn rank(self) -> u8 {
        match self {
            NodeLifecycleState::Init => 1,
            NodeLifecycleState::Running => 2,
            NodeLifecycleState::Shutdown => 3,
        }
    }

    /// The state at the following rank, saturating at the terminal state.
    pub fn next(self) -> Self {
        match self {
            NodeLifecycleState::Init => NodeLifecycleState::Running,
            NodeLifecycleState::Running | NodeLifecycleState::Shutdown => {
                NodeLifecycleState::Shutdown
            }
        }
    }

    /// True once the terminal state is reached.
    pub fn is_terminal(self) -> bool {
        self == NodeLifecycleState::Shutdown
    }

    /// Strict monotonic transition rule: legal iff the target rank is
    /// greater than the current rank.
    pub fn is_transition_allowed(self, to: NodeLifecycleState) -> bool {
        to.rank() > self.rank()
    }
}

impl fmt::Display for NodeLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeLifecycleState::Init => "init",
            NodeLifecycleState::Running => "running",
            NodeLifecycleState::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_never_decreases_rank() {
        for state in [
            NodeLifecycleState::Init,
            NodeLifecycleState::Running,
            NodeLifecycleState::Shutdown,
        ] {
            assert!(state.next().rank() >= state.rank());
        }
    }

    #[test]
    fn init_reaches_shutdown_in_exactly_two_steps() {
        let s0 = NodeLifecycleState::initial();
        let s1 = s0.next();
        let s2 = s1.next();
        assert_eq!(s1, NodeLifecycleState::Running);
        assert_eq!(s2, NodeLifecycleState::Shutdown);
        // Terminal state is a fixed point.
        assert_eq!(s2.next(), NodeLifecycleState::Shutdown);
        assert_eq!(s2.next().next(), NodeLifecycleState::Shutdown);
    }

    #[test]
    fn transition_allowed_iff_rank_increases() {
        use NodeLifecycleState::*;
        let all = [Init, Running, Shutdown];
        for from in all {
            for to in all {
                assert_eq!(
                    from.is_transition_allowed(to),
                    to.rank() > from.rank(),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_flags() {
        assert!(!NodeLifecycleState::Init.is_terminal());
        assert!(!NodeLifecycleState::Running.is_terminal());
        assert!(NodeLifecycleState::Shutdown.is_terminal());
        assert_eq!(NodeLifecycleState::terminal(), NodeLifecycleState::Shutdown);
        assert_eq!(NodeLifecycleState::initial(), NodeLifecycleState::Init);
    }
}
