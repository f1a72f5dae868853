/// Errors the interpreter core distinguishes.
///
/// Tool-level failures never surface here: the invoke step captures them
/// into `ToolResult`s and feeds them back to the model. These variants are
/// the ones that must propagate to the top-level runner.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The run's cancellation token fired.
    #[error("aborted")]
    Aborted,

    /// The LLM provider failed mid-stream or on send.
    #[error("provider error: {0}")]
    Provider(String),

    /// The reboot session file could not be written or read.
    #[error("session error: {0}")]
    Session(String),
}

impl AgentError {
    /// True when `err`'s chain bottoms out in a cancellation.
    pub fn is_aborted(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<AgentError>(), Some(AgentError::Aborted)))
    }
}
