//! Transition table of the launch state machine
//!
//! ```text
//! PENDING --running--> BOOTING --ssh_ok--> CONNECTING --bootstrapped--> ONLINE
//! PENDING --not_running_after_limit | boot_fail | fail--> FAILED
//! BOOTING --ssh_timeout | boot_fail | fail--> FAILED
//! CONNECTING --connect_fail | fail--> FAILED
//! ONLINE --idle--> STOPPING (stop policy) | TERMINATING (terminate policy)
//! STOPPING --stopped--> RESUMABLE --demand--> PENDING
//! any but TERMINATING/TERMINATED --explicit_terminate--> TERMINATING
//! TERMINATING --gone--> TERMINATED
//! ```
//!
//! `gone` is also accepted from every other live state: it is an observation
//! that EC2 already terminated the instance, not a request.

use crate::registry::{InstanceRecord, InstanceRegistry, RegistryError};
use ec2_agents_common::LifecycleState;
use tracing::{debug, info};

/// Inputs of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Event {
    Running,
    BootFail,
    SshOk,
    SshTimeout,
    Bootstrapped,
    ConnectFail,
    NotRunningAfterLimit,
    Idle,
    Stopped,
    Demand,
    ExplicitTerminate,
    Gone,
    /// Permanent error during a launch step
    Fail,
}

/// What an idle agent's instance does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Stop,
    Terminate,
}

impl IdleAction {
    pub fn from_stop_on_terminate(stop: bool) -> Self {
        if stop { Self::Stop } else { Self::Terminate }
    }
}

/// Next state for `event` in `state`, `None` when the event does not apply.
pub fn transition(state: LifecycleState, event: Event, idle: IdleAction) -> Option<LifecycleState> {
    use Event as E;
    use LifecycleState as S;

    match (state, event) {
        (S::Terminated, _) => None,
        (S::Terminating, E::Gone) => Some(S::Terminated),
        (S::Terminating, _) => None,
        (_, E::ExplicitTerminate) => Some(S::Terminating),
        (_, E::Gone) => Some(S::Terminated),

        (S::Pending, E::Running) => Some(S::Booting),
        (S::Pending, E::NotRunningAfterLimit | E::BootFail | E::Fail) => Some(S::Failed),

        (S::Booting, E::SshOk) => Some(S::Connecting),
        (S::Booting, E::SshTimeout | E::BootFail | E::Fail) => Some(S::Failed),

        (S::Connecting, E::Bootstrapped) => Some(S::Online),
        (S::Connecting, E::ConnectFail | E::Fail) => Some(S::Failed),

        (S::Online, E::Idle) => Some(match idle {
            IdleAction::Stop => S::Stopping,
            IdleAction::Terminate => S::Terminating,
        }),

        (S::Stopping, E::Stopped) => Some(S::Resumable),
        (S::Stopping, E::Fail) => Some(S::Failed),
        (S::Resumable, E::Demand) => Some(S::Pending),

        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("event {event} does not apply to state {state}")]
    NotPermitted {
        state: LifecycleState,
        event: Event,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Apply `event` to the record under `key` with a compare-and-set on its
/// current state. The transition is logged to the node log.
pub fn apply(
    registry: &InstanceRegistry,
    key: &str,
    event: Event,
    idle: IdleAction,
) -> Result<InstanceRecord, TransitionError> {
    let current = registry
        .get(key)
        .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
    let Some(next) = transition(current.state, event, idle) else {
        debug!(key, state = %current.state, %event, "Event ignored");
        return Err(TransitionError::NotPermitted {
            state: current.state,
            event,
        });
    };

    let updated = registry.compare_and_set(key, current.state, next)?;
    info!(
        key,
        template = %updated.template_id,
        from = %current.state,
        to = %next,
        %event,
        "State transition"
    );
    updated
        .log
        .event(format!("{} -> {} ({event})", current.state, next));
    Ok(updated)
}
