use std::{
    error::Error,
    fmt::{self, Display},
    net::Ipv4Addr,
    time::Duration,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a warren-related operation.
pub type WarrenResult<T> = Result<T, WarrenError>;

/// An error that occurred while provisioning or running a sandbox.
#[derive(Debug, Error)]
pub enum WarrenError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during JSON serialization.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The sandbox id space for the configured subnet is exhausted.
    #[error("sandbox capacity exhausted: subnet supports at most {limit} concurrent sandboxes")]
    CapacityExhausted {
        /// The number of usable sandbox ids in the subnet.
        limit: u32,
    },

    /// A required host binary, device or image is absent.
    #[error("missing host infrastructure: {0}")]
    InfrastructureMissing(String),

    /// A device, image or control-socket setup step failed before boot.
    #[error("sandbox allocation failed: {0}")]
    AllocationFailed(String),

    /// The hypervisor control plane rejected a configuration or start call.
    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    /// The guest never became reachable within the boot deadline.
    #[error("guest at {ip} not reachable after {waited:?}")]
    ReadinessTimeout {
        /// The guest address that was polled.
        ip: Ipv4Addr,

        /// How long readiness was polled for.
        waited: Duration,
    },

    /// The task exceeded its execution budget.
    #[error("task execution exceeded {limit:?}")]
    ExecutionTimeout {
        /// The execution budget that was exceeded.
        limit: Duration,
    },

    /// The captured task output exceeded the configured byte budget.
    #[error("task output exceeded {limit} bytes")]
    OutputBudgetExceeded {
        /// The maximum number of output bytes allowed.
        limit: usize,
    },

    /// A host command exited with a non-zero status.
    #[error("host command `{command}` failed: {stderr}")]
    CommandFailed {
        /// The command that was run.
        command: String,

        /// The captured standard error of the command.
        stderr: String,
    },

    /// An invalid mount specification was used.
    #[error("invalid mount specification: {0}")]
    InvalidMount(String),

    /// A requested mount was rejected by the mount policy.
    #[error("mount rejected by policy: {0}")]
    MountRejected(String),

    /// No running sandbox exists for the owner.
    #[error("no running sandbox for owner: {0}")]
    SandboxNotFound(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarrenError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> WarrenError {
        WarrenError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether this error is one of the two timeout classes.
    ///
    /// Timeouts are reported to callers distinctly from execution failures,
    /// so the synthesized task result uses a timeout exit code for them.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WarrenError::ReadinessTimeout { .. } | WarrenError::ExecutionTimeout { .. }
        )
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `WarrenResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> WarrenResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
