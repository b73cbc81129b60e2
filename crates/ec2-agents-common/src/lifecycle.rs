//! Instance lifecycle states
//!
//! `LifecycleState` is the local state of an instance record, driven by the
//! launch state machine. `RemoteState` mirrors the EC2 instance state names.

/// Local lifecycle state of an instance record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LifecycleState {
    /// Launch requested, EC2 has not reported `running` yet
    #[default]
    Pending,
    /// EC2 reports `running`, waiting for SSH to answer
    Booting,
    /// SSH answers, agent is being uploaded and started
    Connecting,
    /// Agent attached to the controller
    Online,
    /// Idle timeout fired, stop requested
    Stopping,
    /// Stopped and resumable on new demand
    Resumable,
    /// Termination requested
    Terminating,
    /// EC2 confirmed termination
    Terminated,
    /// Launch failed; the instance is scheduled for termination
    Failed,
}

impl LifecycleState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// States that do not count against instance caps.
    pub fn is_released(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// States in which a launch is still underway.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Booting | Self::Connecting)
    }
}

/// EC2 instance state as reported by DescribeInstances.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RemoteState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl RemoteState {
    /// Instance is gone or going away for good.
    pub fn is_gone(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }

    /// The local state a record should hold given this remote state, when
    /// the remote state forces a change (`None` keeps the local state).
    pub fn implied_local(self, local: LifecycleState) -> Option<LifecycleState> {
        use LifecycleState as L;
        match (self, local) {
            (Self::Terminated, l) if l != L::Terminated => Some(L::Terminated),
            (Self::ShuttingDown, l) if !matches!(l, L::Terminating | L::Terminated) => {
                Some(L::Terminating)
            }
            (Self::Stopped, L::Stopping | L::Online) => Some(L::Resumable),
            (Self::Running, L::Resumable) => Some(L::Pending),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn lifecycle_round_trips_through_strings() {
        for state in LifecycleState::iter() {
            let parsed: LifecycleState = state.as_ref().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert_eq!(LifecycleState::Online.to_string(), "ONLINE");
        assert_eq!("booting".parse::<LifecycleState>().unwrap(), LifecycleState::Booting);
    }

    #[test]
    fn remote_state_parses_ec2_names() {
        assert_eq!("shutting-down".parse::<RemoteState>().unwrap(), RemoteState::ShuttingDown);
        assert_eq!("running".parse::<RemoteState>().unwrap(), RemoteState::Running);
        assert!("rebooting".parse::<RemoteState>().is_err());
    }

    #[test]
    fn released_states_do_not_count() {
        assert!(LifecycleState::Failed.is_released());
        assert!(LifecycleState::Terminated.is_released());
        assert!(!LifecycleState::Terminating.is_released());
        assert!(!LifecycleState::Resumable.is_released());
    }

    #[test]
    fn implied_local_state() {
        use LifecycleState as L;
        assert_eq!(RemoteState::Terminated.implied_local(L::Online), Some(L::Terminated));
        assert_eq!(RemoteState::Terminated.implied_local(L::Terminated), None);
        assert_eq!(RemoteState::Stopped.implied_local(L::Stopping), Some(L::Resumable));
        assert_eq!(RemoteState::Running.implied_local(L::Booting), None);
        assert_eq!(
            RemoteState::ShuttingDown.implied_local(L::Connecting),
            Some(L::Terminating)
        );
    }
}
