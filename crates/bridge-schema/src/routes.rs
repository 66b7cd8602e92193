use bridge_core::config::{RenameRule, RouteConfig};
use bridge_core::types::StreamingKind;
use bridge_core::{Error, Result};

/// A REST request resolved to its gRPC target.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub grpc_service: String,
    pub grpc_method: String,
    pub streaming: StreamingKind,
    pub renames: Vec<RenameRule>,
    /// Placeholder values to inject into the request map, as
    /// `(dotted_field_path, value)`.
    pub bindings: Vec<(String, String)>,
    pub idempotent: bool,
}

impl ResolvedRoute {
    pub fn grpc_path(&self) -> String {
        format!("/{}/{}", self.grpc_service, self.grpc_method)
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    method: String,
    segments: Vec<Segment>,
    config: RouteConfig,
}

/// Per-cluster routing table. Rules match in declaration order; requests no
/// rule covers fall back to verb-based defaults against the cluster's
/// single schema service.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let routes = configs
            .iter()
            .map(|config| CompiledRoute {
                method: config.http_method.to_ascii_uppercase(),
                segments: compile_template(&config.path_template),
                config: config.clone(),
            })
            .collect();
        Self { routes }
    }

    /// Resolve `(method, path)`. `fallback_service` is the service verb
    /// defaults dispatch to when no declared rule matches; with no such
    /// service the request has no route.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
        fallback_service: Option<&str>,
    ) -> Result<ResolvedRoute> {
        let method = method.to_ascii_uppercase();
        let segments: Vec<&str> = split_path(path);

        for route in &self.routes {
            if route.method != method && route.method != "ANY" {
                continue;
            }
            if let Some(bindings) = match_segments(&route.segments, &segments, &route.config) {
                return Ok(ResolvedRoute {
                    grpc_service: route.config.grpc_service.clone(),
                    grpc_method: route.config.grpc_method.clone(),
                    streaming: route.config.streaming,
                    renames: route.config.renames.clone(),
                    bindings,
                    idempotent: route.config.is_idempotent(),
                });
            }
        }

        self.verb_default(&method, &segments, fallback_service, path)
    }

    fn verb_default(
        &self,
        method: &str,
        segments: &[&str],
        fallback_service: Option<&str>,
        path: &str,
    ) -> Result<ResolvedRoute> {
        let grpc_method = match method {
            "GET" => "Get",
            "POST" => "Create",
            "PUT" | "PATCH" => "Update",
            "DELETE" => "Delete",
            _ => {
                return Err(Error::SchemaRouteNotFound {
                    method: method.to_string(),
                    path: path.to_string(),
                })
            }
        };
        let Some(service) = fallback_service else {
            return Err(Error::SchemaRouteNotFound {
                method: method.to_string(),
                path: path.to_string(),
            });
        };

        // Resource-style paths carry the id as their last segment.
        let mut bindings = Vec::new();
        if segments.len() >= 2 && method != "POST" {
            if let Some(last) = segments.last() {
                bindings.push(("resource_id".to_string(), (*last).to_string()));
            }
        }

        Ok(ResolvedRoute {
            grpc_service: service.to_string(),
            grpc_method: grpc_method.to_string(),
            streaming: StreamingKind::Unary,
            renames: Vec::new(),
            bindings,
            idempotent: matches!(method, "GET" | "PUT" | "DELETE"),
        })
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn compile_template(template: &str) -> Vec<Segment> {
    split_path(template)
        .into_iter()
        .map(|seg| {
            if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Segment::Placeholder(name.to_string())
            } else {
                Segment::Literal(seg.to_string())
            }
        })
        .collect()
}

fn match_segments(
    template: &[Segment],
    path: &[&str],
    config: &RouteConfig,
) -> Option<Vec<(String, String)>> {
    if template.len() != path.len() {
        return None;
    }
    let mut bindings = Vec::new();
    for (segment, actual) in template.iter().zip(path) {
        match segment {
            Segment::Literal(expected) => {
                if expected != actual {
                    return None;
                }
            }
            Segment::Placeholder(name) => {
                let field = if name == "id" {
                    config
                        .id_field
                        .clone()
                        .unwrap_or_else(|| "resource_id".to_string())
                } else {
                    name.clone()
                };
                bindings.push((field, (*actual).to_string()));
            }
        }
    }
    Some(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, template: &str, service: &str, grpc_method: &str) -> RouteConfig {
        RouteConfig {
            http_method: method.to_string(),
            path_template: template.to_string(),
            grpc_service: service.to_string(),
            grpc_method: grpc_method.to_string(),
            streaming: StreamingKind::Unary,
            renames: Vec::new(),
            id_field: None,
            idempotent: None,
        }
    }

    #[test]
    fn test_template_match_binds_id() {
        let table = RouteTable::new(&[route("GET", "/users/{id}", "user.v1.UserService", "GetUser")]);
        let resolved = table.resolve("GET", "/users/123", None).unwrap();
        assert_eq!(resolved.grpc_method, "GetUser");
        assert_eq!(resolved.grpc_path(), "/user.v1.UserService/GetUser");
        assert_eq!(resolved.bindings, vec![("resource_id".to_string(), "123".to_string())]);
        assert!(resolved.idempotent);
    }

    #[test]
    fn test_custom_id_field() {
        let mut config = route("GET", "/users/{id}", "user.v1.UserService", "GetUser");
        config.id_field = Some("user_id".to_string());
        let table = RouteTable::new(&[config]);
        let resolved = table.resolve("GET", "/users/42", None).unwrap();
        assert_eq!(resolved.bindings[0].0, "user_id");
    }

    #[test]
    fn test_named_placeholders_bind_to_their_name() {
        let table = RouteTable::new(&[route(
            "GET",
            "/orgs/{org}/repos/{repo}",
            "repo.v1.RepoService",
            "GetRepo",
        )]);
        let resolved = table.resolve("GET", "/orgs/acme/repos/widget", None).unwrap();
        assert_eq!(
            resolved.bindings,
            vec![
                ("org".to_string(), "acme".to_string()),
                ("repo".to_string(), "widget".to_string()),
            ]
        );
    }

    #[test]
    fn test_declaration_order_wins() {
        let table = RouteTable::new(&[
            route("GET", "/users/me", "user.v1.UserService", "GetSelf"),
            route("GET", "/users/{id}", "user.v1.UserService", "GetUser"),
        ]);
        assert_eq!(table.resolve("GET", "/users/me", None).unwrap().grpc_method, "GetSelf");
        assert_eq!(table.resolve("GET", "/users/7", None).unwrap().grpc_method, "GetUser");
    }

    #[test]
    fn test_method_mismatch_falls_through() {
        let table = RouteTable::new(&[route("GET", "/users/{id}", "user.v1.UserService", "GetUser")]);
        let err = table.resolve("POST", "/users/123/extra", None).unwrap_err();
        assert_eq!(err.kind(), "schema.route_not_found");
    }

    #[test]
    fn test_verb_defaults_with_fallback_service() {
        let table = RouteTable::new(&[]);
        let get = table.resolve("GET", "/items/9", Some("inv.v1.Inventory")).unwrap();
        assert_eq!(get.grpc_method, "Get");
        assert_eq!(get.bindings, vec![("resource_id".to_string(), "9".to_string())]);

        let post = table.resolve("POST", "/items", Some("inv.v1.Inventory")).unwrap();
        assert_eq!(post.grpc_method, "Create");
        assert!(post.bindings.is_empty());
        assert!(!post.idempotent);

        let put = table.resolve("PUT", "/items/9", Some("inv.v1.Inventory")).unwrap();
        assert_eq!(put.grpc_method, "Update");
        let delete = table.resolve("DELETE", "/items/9", Some("inv.v1.Inventory")).unwrap();
        assert_eq!(delete.grpc_method, "Delete");
        assert!(delete.idempotent);
    }

    #[test]
    fn test_no_fallback_service_means_no_route() {
        let table = RouteTable::new(&[]);
        let err = table.resolve("GET", "/items/9", None).unwrap_err();
        assert_eq!(err.kind(), "schema.route_not_found");
    }

    #[test]
    fn test_trailing_slash_is_ignored() {
        let table = RouteTable::new(&[route("GET", "/users/{id}", "user.v1.UserService", "GetUser")]);
        assert!(table.resolve("GET", "/users/123/", None).is_ok());
    }
}
