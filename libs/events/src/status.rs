//! Instance statuses and the legal transition table.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Lifecycle status of an instance.
///
/// Used both for the achieved status and for the desired status an intent
/// asks the instance to converge to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Preparing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Destroying,
    Destroyed,
}

impl InstanceStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [InstanceStatus; 8] = [
        InstanceStatus::Created,
        InstanceStatus::Preparing,
        InstanceStatus::Stopped,
        InstanceStatus::Starting,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
        InstanceStatus::Destroying,
        InstanceStatus::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Statuses in which a workload process may exist on the host.
    pub fn has_workload(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether `self -> to` is a legal edge.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        can_transition(*self, to)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EventError::UnknownStatus(s.to_string()))
    }
}

/// Legal status edges. Anything not listed is rejected.
pub const TRANSITIONS: &[(InstanceStatus, &[InstanceStatus])] = {
    use InstanceStatus::*;
    &[
        (Created, &[Preparing]),
        (Preparing, &[Stopped, Destroying]),
        (Stopped, &[Starting, Destroying]),
        (Starting, &[Running, Stopped]),
        (Running, &[Stopping, Stopped]),
        (Stopping, &[Stopped]),
        (Destroying, &[Destroyed]),
        (Destroyed, &[]),
    ]
};

/// Pure lookup in [`TRANSITIONS`].
pub fn can_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    TRANSITIONS
        .iter()
        .find(|(status, _)| *status == from)
        .is_some_and(|(_, targets)| targets.contains(&to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use InstanceStatus::*;

    const LEGAL: [(InstanceStatus, InstanceStatus); 11] = [
        (Created, Preparing),
        (Preparing, Stopped),
        (Preparing, Destroying),
        (Stopped, Starting),
        (Stopped, Destroying),
        (Starting, Running),
        (Starting, Stopped),
        (Running, Stopping),
        (Running, Stopped),
        (Stopping, Stopped),
        (Destroying, Destroyed),
    ];

    fn any_status() -> impl Strategy<Value = InstanceStatus> {
        proptest::sample::select(InstanceStatus::ALL.to_vec())
    }

    #[test]
    fn test_every_pair_matches_table() {
        let mut legal = 0;
        for from in InstanceStatus::ALL {
            for to in InstanceStatus::ALL {
                let expected = LEGAL.contains(&(from, to));
                assert_eq!(can_transition(from, to), expected, "{from} -> {to}");
                legal += usize::from(expected);
            }
        }
        assert_eq!(legal, LEGAL.len());
    }

    #[test]
    fn test_destroyed_is_terminal() {
        assert!(Destroyed.is_terminal());
        assert!(InstanceStatus::ALL
            .iter()
            .all(|to| !can_transition(Destroyed, *to)));
    }

    #[test]
    fn test_no_self_loops() {
        for status in InstanceStatus::ALL {
            assert!(!status.can_transition_to(status), "{status} loops");
        }
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("destroying".parse::<InstanceStatus>().unwrap(), Destroying);
        assert_eq!(Running.to_string(), "running");
        assert!(matches!(
            "booting".parse::<InstanceStatus>(),
            Err(EventError::UnknownStatus(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_can_transition_matches_table(from in any_status(), to in any_status()) {
            prop_assert_eq!(can_transition(from, to), LEGAL.contains(&(from, to)));
        }

        #[test]
        fn prop_destroying_only_from_preparing_or_stopped(from in any_status()) {
            prop_assert_eq!(
                can_transition(from, Destroying),
                matches!(from, Preparing | Stopped)
            );
        }
    }
}
