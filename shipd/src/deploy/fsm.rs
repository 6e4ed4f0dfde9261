//! Finite State Machine for release status

use crate::models::release::ReleaseStatus;

/// Release event
#[derive(Debug, Clone)]
pub enum ReleaseEvent {
    /// Start building the image or compose project
    Build,

    /// Start replacing containers
    Deploy,

    /// New containers verified, release is live
    Activate,

    /// A newer release went live
    Supersede,

    /// Rollback brought a superseded release back
    Reactivate,

    /// Any step failed
    Fail(String),
}

/// Release FSM
#[derive(Debug, Clone)]
pub struct ReleaseFsm {
    state: ReleaseStatus,
    error: Option<String>,
}

impl ReleaseFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::from_state(ReleaseStatus::Pending)
    }

    /// Resume the FSM from a persisted status
    pub fn from_state(state: ReleaseStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> ReleaseStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: ReleaseEvent) -> Result<ReleaseStatus, String> {
        let new_state = match (self.state, &event) {
            (ReleaseStatus::Pending, ReleaseEvent::Build) => ReleaseStatus::Building,
            (ReleaseStatus::Pending | ReleaseStatus::Building, ReleaseEvent::Deploy) => {
                ReleaseStatus::Deploying
            }
            (ReleaseStatus::Deploying, ReleaseEvent::Activate) => ReleaseStatus::Active,
            (ReleaseStatus::Active, ReleaseEvent::Supersede) => ReleaseStatus::Success,
            (ReleaseStatus::Success, ReleaseEvent::Reactivate) => ReleaseStatus::Active,

            // Only in-flight releases can fail
            (
                ReleaseStatus::Pending | ReleaseStatus::Building | ReleaseStatus::Deploying,
                ReleaseEvent::Fail(err),
            ) => {
                self.error = Some(err.clone());
                ReleaseStatus::Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for ReleaseFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a persisted status may move directly to `to`
pub fn can_transition(from: ReleaseStatus, to: ReleaseStatus) -> bool {
    if from == to {
        return true;
    }
    let event = match to {
        ReleaseStatus::Pending => return false,
        ReleaseStatus::Building => ReleaseEvent::Build,
        ReleaseStatus::Deploying => ReleaseEvent::Deploy,
        ReleaseStatus::Active if from == ReleaseStatus::Success => ReleaseEvent::Reactivate,
        ReleaseStatus::Active => ReleaseEvent::Activate,
        ReleaseStatus::Success => ReleaseEvent::Supersede,
        ReleaseStatus::Failed => ReleaseEvent::Fail(String::new()),
    };
    ReleaseFsm::from_state(from).process(event).is_ok()
}
