/// Errors surfaced by the orchestration client.
///
/// Backend transport failures are wrapped transparently; everything else is
/// a precondition or state violation the caller can act on.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid runtime descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("node is not running: {0}")]
    NotRunning(String),

    #[error("registration rejected with code {code}")]
    RegistrationRejected { code: i32, log_path: Option<String> },

    #[error("an installation is already in progress")]
    InstallBusy,

    #[error("workflow references unknown node: {0}")]
    UnknownNode(String),

    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
