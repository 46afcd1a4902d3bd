/// Lifecycle of a session.
///
/// Transitions are monotonic within one operation:
/// `Idle → Discovering → Idle` for find, and
/// `Idle → Initializing → Transferring → (Completed | Aborted | Failed)`
/// for upload, with `Aborting` entered from either in-flight upload
/// state. Terminal states are sticky until the handle is re-issued a
/// fresh `find` or `upload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Discovering,
    Initializing,
    Transferring,
    Aborting,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    /// A network operation is currently in flight on this session.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::Discovering
                | SessionState::Initializing
                | SessionState::Transferring
                | SessionState::Aborting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }

    /// `abort_upload` is only meaningful while the upload is actually
    /// doing something.
    pub fn can_abort(self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Transferring)
    }
}
