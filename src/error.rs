//! Errors.

/// Top-level error type produced anywhere in the connection pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Compiler(#[from] CompilerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("in-transaction error: a non-rollback statement was attempted while the backend transaction is aborted")]
    InTransaction,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("internal server error: {0}")]
    Internal(String),
    #[error("shutting down")]
    ShuttingDown,
}

impl Error {
    /// `true` for kinds whose handler must NOT write an error message
    /// and simply terminates the loop (§4.2 / §7).
    pub fn is_connection_aborted(&self) -> bool {
        matches!(self, Error::ConnectionAborted)
    }
}

/// Error codes used by the error writer (§4.6) for everything that isn't
/// a backend-originated error (those go through `QueryCompiler::
/// interpret_backend_error` instead). Values are this crate's own scheme;
/// the spec only requires a code unique per error class.
pub const CODE_BINARY_PROTOCOL: u32 = 0x03_00_00_00;
pub const CODE_TRANSACTION_ERROR: u32 = 0x03_02_00_00;
pub const CODE_INTERNAL_SERVER_ERROR: u32 = 0x01_00_00_00;

/// Errors raised by the framing layer or the top-level dispatcher (§4.1, §4.2, §7).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {hi}.{lo}")]
    UnsupportedProtocolVersion { hi: i16, lo: i16 },
    #[error("unexpected message type {actual:?}, expected {expected:?}")]
    UnexpectedMessageType { expected: u8, actual: u8 },
    #[error("unknown message type byte {0:#x}")]
    UnknownMessageType(u8),
    #[error("required string field was empty")]
    EmptyRequiredString,
    #[error("unsupported output mode {0:#x}")]
    UnsupportedOutputMode(u8),
    #[error("unsupported legacy sub-language {0:#x}")]
    UnsupportedLegacyLanguage(u8),
    #[error("named prepared statements are not supported, got {0:?}")]
    NamedStatementUnsupported(String),
    #[error("unsupported describe kind {0:#x}")]
    UnsupportedDescribeKind(u8),
    #[error("no anonymous statement has been parsed on this connection")]
    TypeSpecNotFound,
    #[error("legacy graphql is not allowed inside an open transaction")]
    GraphqlInTransaction,
    #[error("message truncated: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown backend transaction status byte {0:#x}")]
    UnknownTransactionStatus(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised during startup/auth (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("client handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("credentials rejected for user {user:?}")]
    CredentialsRejected { user: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the `SqlBackend` collaborator (§11).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend reported: {message} (code {code})")]
    Reported { code: String, message: String },
    #[error("backend connection is no longer usable")]
    Gone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the `QueryCompiler` collaborator (§11).
#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("compiler rejected query: {0}")]
    Rejected(String),
    #[error("compiler RPC failed: {0}")]
    Rpc(String),
}

/// Errors raised while loading or parsing configuration (§10.3).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
