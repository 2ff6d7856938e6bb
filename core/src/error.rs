use thiserror::Error;

/// Dockling error types
#[derive(Error, Debug)]
pub enum DocklingError {
    /// Image, container, layer or tag absent
    #[error("No such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation not valid for the current lifecycle state
    #[error("Container {id} is {state}: cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// Start requested on a container that is already running
    #[error("Container {0} is already running")]
    AlreadyRunning(String),

    /// Removal of a running container without force
    #[error("Container {0} is running. Stop it first or use --force")]
    ContainerRunning(String),

    /// Requested container name is taken
    #[error("Conflict: container name \"{0}\" is already in use")]
    NameConflict(String),

    /// Name or ID prefix matches more than one entity
    #[error("Ambiguous {kind} reference \"{query}\": matches {count}")]
    Ambiguous {
        kind: &'static str,
        query: String,
        count: usize,
    },

    /// Build instruction failed
    #[error("Build failed at step {step} ({instruction}): {cause}")]
    BuildError {
        step: usize,
        instruction: String,
        cause: String,
    },

    /// Recipe could not be parsed
    #[error("Recipe error: {0}")]
    RecipeError(String),

    /// Build cancelled between instructions
    #[error("Build cancelled before step {0}")]
    Cancelled(usize),

    /// Tag moved under a compare-and-swap
    #[error("Tag {tag} was updated concurrently")]
    TagConflict { tag: String },

    /// Invalid image reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Registry unreachable or returned a transient failure
    #[error("Network error: {registry} - {message}")]
    NetworkError { registry: String, message: String },

    /// Registry rejected the credentials
    #[error("Authentication failed for {registry}: {message}")]
    AuthError { registry: String, message: String },

    /// Registry protocol violation or content mismatch
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Process launch or signalling failed
    #[error("Process error: {0}")]
    ProcessError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DocklingError {
    /// Shorthand for a [`DocklingError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a registry operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => 2,
            Self::InvalidState { .. }
            | Self::AlreadyRunning(_)
            | Self::ContainerRunning(_)
            | Self::NameConflict(_)
            | Self::Ambiguous { .. }
            | Self::TagConflict { .. } => 3,
            Self::BuildError { .. } | Self::RecipeError(_) | Self::Cancelled(_) => 4,
            Self::NetworkError { .. } | Self::AuthError { .. } | Self::RegistryError { .. } => 5,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for DocklingError {
    fn from(err: serde_json::Error) -> Self {
        DocklingError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DocklingError {
    fn from(err: serde_yaml::Error) -> Self {
        DocklingError::SerializationError(err.to_string())
    }
}

/// Result type alias for Dockling operations
pub type Result<T> = std::result::Result<T, DocklingError>;
