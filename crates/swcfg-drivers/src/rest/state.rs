//! NVUE revision state vocabulary.
//!
//! A revision is always in one of a fixed set of states. Anything the API
//! reports outside this set is treated as a protocol error.

use std::fmt;
use std::str::FromStr;

use swcfg_common::{DeployError, DeployResult};

/// Groups of states that drive the polling phases of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateClass {
    /// The revision is in the process of being activated.
    Blocking,
    /// Waiting for an earlier revision to finish.
    WaitForTurn,
    /// The device is checking and verifying the revision.
    Preprocessing,
    /// The device is reloading services.
    Reloading,
    /// Activated and waiting for confirmation.
    AwaitConfirm,
    /// Activated and confirmed.
    Applied,
    /// Being written to the startup configuration.
    Saving,
    /// Applied and written to the startup configuration.
    Saved,
    /// Activation failed.
    Failed,
}

impl StateClass {
    /// Returns the class name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateClass::Blocking => "blocking",
            StateClass::WaitForTurn => "wait-for-turn",
            StateClass::Preprocessing => "preprocessing",
            StateClass::Reloading => "reloading",
            StateClass::AwaitConfirm => "await-confirm",
            StateClass::Applied => "applied",
            StateClass::Saving => "saving",
            StateClass::Saved => "saved",
            StateClass::Failed => "failed",
        }
    }
}

macro_rules! revision_states {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// State of a revision as reported by the API.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RevisionState {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl RevisionState {
            /// Every valid state.
            pub const ALL: &'static [RevisionState] = &[$(RevisionState::$variant),+];

            /// Returns the state as spelled by the API.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(RevisionState::$variant => $name,)+
                }
            }
        }

        impl FromStr for RevisionState {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(RevisionState::$variant),)+
                    other => Err(other.to_string()),
                }
            }
        }
    };
}

revision_states! {
    Applied => "applied",
    AppliedAndSaved => "applied_and_saved",
    Apply => "apply",
    ApplyError => "apply_error",
    ApplyFail => "apply_fail",
    AutoSave => "auto_save",
    AutoSaving => "auto_saving",
    Ays => "ays",
    AysFail => "ays_fail",
    AysNo => "ays_no",
    AysYes => "ays_yes",
    Checked => "checked",
    Checking => "checking",
    Confirm => "confirm",
    ConfirmFail => "confirm_fail",
    ConfirmNo => "confirm_no",
    ConfirmYes => "confirm_yes",
    Detached => "detached",
    IgnoreFail => "ignore_fail",
    IgnoreFailNo => "ignore_fail_no",
    IgnoreFailYes => "ignore_fail_yes",
    Inactive => "inactive",
    Invalid => "invalid",
    Pending => "pending",
    Ready => "ready",
    ReadyError => "ready_error",
    Readying => "readying",
    Reloaded => "reloaded",
    Reloading => "reloading",
    Verified => "verified",
    VerifyError => "verify_error",
    Verifying => "verifying",
}

impl RevisionState {
    /// Parses a state reported for `revision`.
    pub fn parse(revision: &str, state: &str) -> DeployResult<Self> {
        state
            .parse()
            .map_err(|state| DeployError::UnknownRevisionState {
                revision: revision.to_string(),
                state,
            })
    }

    /// Returns true if the state belongs to `class`.
    pub fn is(&self, class: StateClass) -> bool {
        use RevisionState::*;

        match class {
            StateClass::Blocking => matches!(
                self,
                Apply
                    | Ays
                    | AysNo
                    | AysYes
                    | Confirm
                    | ConfirmNo
                    | ConfirmYes
                    | Detached
                    | IgnoreFail
                    | IgnoreFailNo
                    | IgnoreFailYes
                    | Ready
                    | ReadyError
                    | Readying
                    | Reloaded
                    | Reloading
                    | VerifyError
                    | Verifying
            ),
            StateClass::WaitForTurn => matches!(self, Apply),
            StateClass::Preprocessing => matches!(
                self,
                Checked | Checking | Pending | Ready | Readying | Verified | Verifying
            ),
            StateClass::Reloading => matches!(self, Reloading | Reloaded),
            StateClass::AwaitConfirm => matches!(self, Confirm),
            StateClass::Applied => matches!(self, Applied | AppliedAndSaved | AutoSave),
            StateClass::Saving => matches!(self, AutoSave | AutoSaving),
            StateClass::Saved => matches!(self, AppliedAndSaved),
            StateClass::Failed => matches!(
                self,
                ApplyError | ApplyFail | AysFail | ConfirmFail | Invalid | ReadyError | VerifyError
            ),
        }
    }
}

impl fmt::Display for RevisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_size() {
        assert_eq!(RevisionState::ALL.len(), 32);
    }

    #[test]
    fn test_round_trip_names() {
        for state in RevisionState::ALL {
            assert_eq!(state.as_str().parse::<RevisionState>(), Ok(*state));
        }
    }

    #[test]
    fn test_unknown_state() {
        let err = RevisionState::parse("rev-7", "exploded").unwrap_err();
        match err {
            DeployError::UnknownRevisionState { revision, state } => {
                assert_eq!(revision, "rev-7");
                assert_eq!(state, "exploded");
            }
            other => panic!("Expected UnknownRevisionState, got {:?}", other),
        }
    }

    #[test]
    fn test_classes() {
        assert!(RevisionState::Apply.is(StateClass::WaitForTurn));
        assert!(RevisionState::Apply.is(StateClass::Blocking));
        assert!(RevisionState::AutoSave.is(StateClass::Applied));
        assert!(RevisionState::AutoSave.is(StateClass::Saving));
        assert!(RevisionState::VerifyError.is(StateClass::Failed));
        assert!(!RevisionState::Inactive.is(StateClass::Blocking));
        assert!(!RevisionState::Pending.is(StateClass::Blocking));
        assert!(RevisionState::AppliedAndSaved.is(StateClass::Saved));
    }

    #[test]
    fn test_class_sizes() {
        let count = |class| {
            RevisionState::ALL
                .iter()
                .filter(|state| state.is(class))
                .count()
        };
        assert_eq!(count(StateClass::Blocking), 18);
        assert_eq!(count(StateClass::Preprocessing), 7);
        assert_eq!(count(StateClass::Failed), 7);
        assert_eq!(count(StateClass::Applied), 3);
    }
}
