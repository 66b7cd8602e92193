pub mod catalog;
pub mod rename;
pub mod routes;
pub mod translate;

pub use catalog::{CompatibilityReport, SchemaCatalog, SchemaVersion};
pub use routes::{ResolvedRoute, RouteTable};
pub use translate::{grpc_to_rest, rest_to_grpc, ContentKind, RestEnvelope, TranslateOptions};

#[cfg(test)]
pub(crate) mod testutil;
