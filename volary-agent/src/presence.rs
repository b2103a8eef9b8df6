//! Mapping from domain state to bus presence.

use volary_bus::PresenceShow;
use volary_hypervisor::DomainState;

use crate::protocol::*;

/// The presence derived from an observed domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub show: PresenceShow,
    pub status: &'static str,
    /// Desired state of the `libvirt_run` trigger.
    pub run_trigger: bool,
}

/// Map an observed domain state to presence. `None` means the domain is not
/// defined at all.
///
/// Total over all states; transient "Migrating..." and "Cloning..." presences
/// are set by their coordinators and never go through this table.
pub fn presence_for(state: Option<DomainState>) -> PresenceUpdate {
    let (show, status, run_trigger) = match state {
        Some(DomainState::Running) | Some(DomainState::Blocked) => {
            (PresenceShow::Available, STATUS_RUNNING, true)
        }
        Some(DomainState::Paused) => (PresenceShow::Away, STATUS_PAUSED, false),
        Some(DomainState::ShutOff) | Some(DomainState::NoState) => {
            (PresenceShow::ExtendedAway, STATUS_SHUT_OFF, false)
        }
        Some(DomainState::Shutdown) => (PresenceShow::Available, STATUS_SHUTDOWNING, false),
        Some(DomainState::Crashed) => (PresenceShow::ExtendedAway, STATUS_CRASHED, false),
        None => (PresenceShow::ExtendedAway, STATUS_NOT_DEFINED, false),
    };
    PresenceUpdate {
        show,
        status,
        run_trigger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_is_total_and_matches_the_table() {
        let cases = [
            (
                Some(DomainState::Running),
                PresenceShow::Available,
                STATUS_RUNNING,
                true,
            ),
            (
                Some(DomainState::Blocked),
                PresenceShow::Available,
                STATUS_RUNNING,
                true,
            ),
            (
                Some(DomainState::Paused),
                PresenceShow::Away,
                STATUS_PAUSED,
                false,
            ),
            (
                Some(DomainState::ShutOff),
                PresenceShow::ExtendedAway,
                STATUS_SHUT_OFF,
                false,
            ),
            (
                Some(DomainState::Shutdown),
                PresenceShow::Available,
                STATUS_SHUTDOWNING,
                false,
            ),
            (
                Some(DomainState::Crashed),
                PresenceShow::ExtendedAway,
                STATUS_CRASHED,
                false,
            ),
            (
                Some(DomainState::NoState),
                PresenceShow::ExtendedAway,
                STATUS_SHUT_OFF,
                false,
            ),
            (None, PresenceShow::ExtendedAway, STATUS_NOT_DEFINED, false),
        ];
        for (state, show, status, trigger) in cases {
            let update = presence_for(state);
            assert_eq!(update.show, show, "show for {:?}", state);
            assert_eq!(update.status, status, "status for {:?}", state);
            assert_eq!(update.run_trigger, trigger, "trigger for {:?}", state);
        }
    }

    #[test]
    fn run_trigger_is_on_iff_active() {
        for state in [
            DomainState::NoState,
            DomainState::Running,
            DomainState::Blocked,
            DomainState::Paused,
            DomainState::Shutdown,
            DomainState::ShutOff,
            DomainState::Crashed,
        ] {
            assert_eq!(presence_for(Some(state)).run_trigger, state.is_active());
        }
    }
}
