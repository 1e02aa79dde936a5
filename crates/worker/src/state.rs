use serde::Serialize;

/// Worker通道状态
///
/// 只能向前推进：Default -> Initializing -> Initialized；
/// Faulted 和 Disposed 是终态，任何状态都可以进入 Disposed。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Default,
    Initializing,
    Initialized,
    Faulted,
    Disposed,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Default, Initializing)
                | (Initializing, Initialized)
                | (Default | Initializing | Initialized, Faulted)
                | (Default | Initializing | Initialized | Faulted, Disposed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Faulted | ChannelState::Disposed)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Default => "default",
            ChannelState::Initializing => "initializing",
            ChannelState::Initialized => "initialized",
            ChannelState::Faulted => "faulted",
            ChannelState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelState::*;

    #[test]
    fn test_state_only_moves_forward() {
        assert!(Default.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Initialized));
        assert!(Initializing.can_transition_to(Faulted));
        assert!(!Initialized.can_transition_to(Initializing));
        assert!(!Initialized.can_transition_to(Initialized));
        assert!(!Faulted.can_transition_to(Initialized));
        assert!(!Disposed.can_transition_to(Faulted));
    }

    #[test]
    fn test_disposed_reachable_from_any_live_state() {
        for state in [Default, Initializing, Initialized, Faulted] {
            assert!(state.can_transition_to(Disposed), "{state} -> disposed");
        }
        assert!(!Disposed.can_transition_to(Disposed));
        assert!(Faulted.is_terminal());
        assert!(!Initialized.is_terminal());
    }
}
