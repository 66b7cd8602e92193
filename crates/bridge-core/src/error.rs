use thiserror::Error;

/// Bridge-wide error type. Every variant maps to a stable wire kind string
/// that clients can match on, and to an HTTP status for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no instances available for cluster '{cluster}'")]
    ServiceUnavailable { cluster: String },

    #[error("circuit open for cluster '{cluster}'")]
    CircuitOpen {
        cluster: String,
        /// Remaining open time, when known. Surfaced as Retry-After.
        retry_after_ms: Option<u64>,
    },

    #[error("bulkhead full for cluster '{cluster}'")]
    BulkheadFull { cluster: String },

    #[error("bulkhead queue timeout for cluster '{cluster}'")]
    BulkheadTimeout { cluster: String },

    #[error("failed to connect to instance '{instance}': {detail}")]
    ChannelConnectFailed { instance: String, detail: String },

    #[error("channel to instance '{instance}' is closed")]
    ChannelClosed { instance: String },

    #[error("backend deadline exceeded")]
    GrpcDeadlineExceeded,

    #[error("backend unavailable: {0}")]
    GrpcUnavailable(String),

    #[error("backend resource exhausted: {0}")]
    GrpcResourceExhausted(String),

    #[error("backend rejected argument: {0}")]
    GrpcInvalidArgument(String),

    #[error("backend error ({code}): {message}")]
    GrpcOther { code: String, message: String },

    #[error("schema not registered: {0}")]
    SchemaNotRegistered(String),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("field type mismatch: {0}")]
    SchemaFieldTypeMismatch(String),

    #[error("unknown field: {0}")]
    SchemaUnknownField(String),

    #[error("no route for {method} {path}")]
    SchemaRouteNotFound { method: String, path: String },

    #[error("schema version '{0}' already registered with a different hash")]
    SchemaVersionConflict(String),

    #[error("total request deadline exceeded")]
    TimeoutTotal,

    #[error("duplicate instance '{id}' in cluster '{cluster}'")]
    RegistryDuplicate { cluster: String, id: String },

    #[error("registry capacity exceeded ({limit} instances)")]
    RegistryCapacity { limit: usize },

    #[error("invalid instance registration: {0}")]
    RegistryInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable wire-surface kind string. Clients match on these; do not rename.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config.invalid",
            Error::ServiceUnavailable { .. } => "service.unavailable",
            Error::CircuitOpen { .. } => "circuit.open",
            Error::BulkheadFull { .. } => "bulkhead_full",
            Error::BulkheadTimeout { .. } => "bulkhead_timeout",
            Error::ChannelConnectFailed { .. } => "channel.connect_failed",
            Error::ChannelClosed { .. } => "channel.closed",
            Error::GrpcDeadlineExceeded => "grpc.deadline_exceeded",
            Error::GrpcUnavailable(_) => "grpc.unavailable",
            Error::GrpcResourceExhausted(_) => "grpc.resource_exhausted",
            Error::GrpcInvalidArgument(_) => "grpc.invalid_argument",
            Error::GrpcOther { .. } => "grpc.error",
            Error::SchemaNotRegistered(_) => "schema.not_registered",
            Error::SchemaParse(_) => "schema.parse_error",
            Error::SchemaFieldTypeMismatch(_) => "schema.field_type_mismatch",
            Error::SchemaUnknownField(_) => "schema.unknown_field",
            Error::SchemaRouteNotFound { .. } => "schema.route_not_found",
            Error::SchemaVersionConflict(_) => "schema.version_conflict",
            Error::TimeoutTotal => "timeout.total",
            Error::RegistryDuplicate { .. } => "registry.duplicate",
            Error::RegistryCapacity { .. } => "registry.capacity_exceeded",
            Error::RegistryInvalid(_) => "registry.invalid",
            Error::NotFound(_) => "not_found",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) => "internal",
            Error::Io(_) => "internal",
            Error::Internal(_) => "internal",
        }
    }

    /// HTTP status the gateway surfaces for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ConfigInvalid(_) => 500,
            Error::ServiceUnavailable { .. } | Error::CircuitOpen { .. } => 503,
            Error::BulkheadFull { .. } | Error::BulkheadTimeout { .. } => 429,
            Error::ChannelConnectFailed { .. } => 502,
            Error::ChannelClosed { .. } => 503,
            Error::GrpcDeadlineExceeded | Error::TimeoutTotal => 504,
            Error::GrpcUnavailable(_) | Error::GrpcResourceExhausted(_) => 503,
            Error::GrpcInvalidArgument(_) => 400,
            Error::GrpcOther { .. } => 502,
            Error::SchemaNotRegistered(_)
            | Error::SchemaParse(_)
            | Error::SchemaFieldTypeMismatch(_)
            | Error::SchemaUnknownField(_)
            | Error::SchemaRouteNotFound { .. } => 422,
            Error::SchemaVersionConflict(_) => 409,
            Error::RegistryDuplicate { .. } => 409,
            Error::RegistryCapacity { .. } => 507,
            Error::RegistryInvalid(_) => 400,
            Error::NotFound(_) => 404,
            Error::Cancelled => 499,
            Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => 500,
        }
    }

    /// Kinds the dispatcher may retry (idempotent routes only).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::GrpcDeadlineExceeded
                | Error::GrpcUnavailable(_)
                | Error::GrpcResourceExhausted(_)
        )
    }

    /// Whether this outcome counts as a failure in the circuit breaker
    /// window. Shed load and cancellations never do.
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::BulkheadFull { .. }
                | Error::BulkheadTimeout { .. }
                | Error::Cancelled
                | Error::SchemaNotRegistered(_)
                | Error::SchemaParse(_)
                | Error::SchemaFieldTypeMismatch(_)
                | Error::SchemaUnknownField(_)
                | Error::SchemaRouteNotFound { .. }
                | Error::SchemaVersionConflict(_)
        )
    }
}
