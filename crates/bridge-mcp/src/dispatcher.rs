use crate::backoff::RetryBackoff;
use crate::breaker::CallOutcome;
use crate::cache::ResponseCache;
use crate::clusters::{ClusterMap, ClusterRuntime};
use crate::codec::DynamicCodec;
use crate::pool::ChannelPool;
use bridge_core::config::{Compression, McpConfig};
use bridge_core::types::StreamingKind;
use bridge_core::{Error, Result};
use bridge_registry::ServiceRegistry;
use bridge_schema::translate::{
    build_request_map, grpc_to_rest, map_to_message, request_metadata, rest_to_grpc_stream,
};
use bridge_schema::{ResolvedRoute, RestEnvelope, SchemaCatalog, TranslateOptions};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::Code;
use tracing::{debug, warn};

/// Reply from one dispatch.
pub enum DispatchResult {
    Unary {
        data: Value,
        instance_id: String,
        execution_time_ms: u64,
    },
    /// Server-stream surfaced as NDJSON: one document per reply message.
    Stream {
        items: mpsc::Receiver<Result<Value>>,
        instance_id: String,
    },
}

/// The request-path orchestrator. Owns no state of its own; composes the
/// registry, per-cluster runtime (balancer + breaker), channel pool, and
/// schema catalog into the resilience recipe, one call per request.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    clusters: Arc<ClusterMap>,
    pool: Arc<ChannelPool>,
    catalog: Arc<SchemaCatalog>,
    mcp: McpConfig,
    translate: TranslateOptions,
    cache: Option<ResponseCache>,
    backoff: RetryBackoff,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        clusters: Arc<ClusterMap>,
        pool: Arc<ChannelPool>,
        catalog: Arc<SchemaCatalog>,
        mcp: McpConfig,
        translate: TranslateOptions,
    ) -> Self {
        let cache = mcp.enable_response_caching.then(|| {
            ResponseCache::new(
                Duration::from_secs(mcp.cache_ttl_secs),
                mcp.cache_max_entries,
            )
        });
        let backoff = RetryBackoff::new(
            Duration::from_millis(mcp.initial_backoff_ms),
            mcp.backoff_multiplier,
            Duration::from_millis(mcp.max_backoff_ms),
        );
        Self {
            registry,
            clusters,
            pool,
            catalog,
            mcp,
            translate,
            cache,
            backoff,
        }
    }

    pub fn clusters(&self) -> &Arc<ClusterMap> {
        &self.clusters
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    /// Dispatch one REST envelope to the named cluster.
    pub async fn dispatch(&self, cluster_name: &str, envelope: RestEnvelope) -> Result<DispatchResult> {
        let cluster = self
            .clusters
            .get(cluster_name)
            .ok_or_else(|| Error::NotFound(format!("cluster '{cluster_name}'")))?;

        // Fail fast before any translation or permits when nothing can
        // serve the request.
        if self.healthy_instances(cluster_name).is_empty() {
            return Err(Error::ServiceUnavailable {
                cluster: cluster_name.to_string(),
            });
        }

        let route = cluster.routes().resolve(
            &envelope.method,
            &envelope.path,
            self.catalog.single_service().as_deref(),
        )?;
        if route.streaming == StreamingKind::Bidi {
            // Bidi lives on the WebSocket transport, not the JSON path.
            return Err(Error::SchemaRouteNotFound {
                method: envelope.method.clone(),
                path: envelope.path.clone(),
            });
        }
        let method_desc = self
            .catalog
            .method_descriptor(&route.grpc_service, &route.grpc_method)?;

        let request_doc = build_request_map(&route, &envelope)?;

        let cache_key = self.cache_key(&cluster, &route, &envelope, &request_doc);
        if let Some(key) = &cache_key {
            if let Some((data, instance_id)) = self.cache.as_ref().unwrap().get(key) {
                debug!(cluster = cluster_name, "response served from cache");
                return Ok(DispatchResult::Unary {
                    data,
                    instance_id,
                    execution_time_ms: 0,
                });
            }
        }

        let total_timeout = self.total_timeout(&cluster, &envelope);
        let deadline = Instant::now() + total_timeout;

        self.attempt_loop(
            cluster_name,
            &cluster,
            &route,
            &method_desc,
            &request_doc,
            &envelope,
            deadline,
            cache_key,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        cluster_name: &str,
        cluster: &Arc<ClusterRuntime>,
        route: &ResolvedRoute,
        method_desc: &MethodDescriptor,
        request_doc: &Value,
        envelope: &RestEnvelope,
        deadline: Instant,
        cache_key: Option<String>,
    ) -> Result<DispatchResult> {
        let max_retries = cluster.config().retries(&self.mcp);
        let mut retries_done: u32 = 0;
        let mut channel_retry_used = false;
        let mut avoid_instance: Option<String> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimeoutTotal);
            }

            let mut instances = self.healthy_instances(cluster_name);
            if instances.is_empty() {
                return Err(Error::ServiceUnavailable {
                    cluster: cluster_name.to_string(),
                });
            }
            if let Some(avoid) = &avoid_instance {
                if instances.len() > 1 {
                    instances.retain(|i| &i.id != avoid);
                }
            }

            let request_key = route.bindings.first().map(|(_, v)| v.clone());
            let instance = cluster
                .balancer()
                .pick(&instances, request_key.as_deref())
                .ok_or_else(|| Error::ServiceUnavailable {
                    cluster: cluster_name.to_string(),
                })?;

            // Short-circuits (open circuit, full bulkhead) are final.
            let permit = cluster.breaker().admit().await?;

            cluster.balancer().on_start(&instance.id);
            let started = Instant::now();

            let outcome = self
                .invoke(cluster, route, method_desc, request_doc, envelope, &instance, deadline)
                .await;

            match outcome {
                Ok(Invoked::Unary { message, no_store }) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    cluster.balancer().on_end(&instance.id, true, duration_ms);
                    self.registry
                        .record_call(cluster_name, &instance.id, true, duration_ms);
                    permit.release(CallOutcome::Success { duration_ms });

                    let data = grpc_to_rest(&message, route, &self.translate)?;
                    if let (Some(key), Some(cache), false) =
                        (cache_key, self.cache.as_ref(), no_store)
                    {
                        cache.put(key, data.clone(), &instance.id);
                    }
                    return Ok(DispatchResult::Unary {
                        data,
                        instance_id: instance.id.clone(),
                        execution_time_ms: duration_ms,
                    });
                }
                Ok(Invoked::Collected { items }) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    cluster.balancer().on_end(&instance.id, true, duration_ms);
                    self.registry
                        .record_call(cluster_name, &instance.id, true, duration_ms);
                    permit.release(CallOutcome::Success { duration_ms });
                    return Ok(DispatchResult::Unary {
                        data: Value::Array(items),
                        instance_id: instance.id.clone(),
                        execution_time_ms: duration_ms,
                    });
                }
                Ok(Invoked::Streaming { mut streaming, handle }) => {
                    // The pump task takes ownership of the permit and the
                    // channel slot, and reports the final outcome when the
                    // stream ends.
                    let (tx, rx) = mpsc::channel(32);
                    let route = route.clone();
                    let translate = self.translate;
                    let max_items = self.mcp.max_stream_items;
                    let cluster = cluster.clone();
                    let registry = self.registry.clone();
                    let cluster_name = cluster_name.to_string();
                    let instance_id = instance.id.clone();
                    let reply_instance = instance_id.clone();
                    tokio::spawn(async move {
                        let _handle = handle;
                        let mut ok = true;
                        let mut sent = 0usize;
                        while sent < max_items {
                            let next = tokio::time::timeout(
                                deadline.saturating_duration_since(Instant::now()),
                                streaming.message(),
                            )
                            .await;
                            match next {
                                Ok(Ok(Some(message))) => {
                                    let item = grpc_to_rest(&message, &route, &translate);
                                    if tx.send(item).await.is_err() {
                                        break;
                                    }
                                    sent += 1;
                                }
                                Ok(Ok(None)) => break,
                                Ok(Err(status)) => {
                                    ok = false;
                                    let _ = tx.send(Err(map_status(status))).await;
                                    break;
                                }
                                Err(_) => {
                                    ok = false;
                                    let _ = tx.send(Err(Error::GrpcDeadlineExceeded)).await;
                                    break;
                                }
                            }
                        }
                        let duration_ms = started.elapsed().as_millis() as u64;
                        cluster.balancer().on_end(&instance_id, ok, duration_ms);
                        registry.record_call(&cluster_name, &instance_id, ok, duration_ms);
                        permit.release(if ok {
                            CallOutcome::Success { duration_ms }
                        } else {
                            CallOutcome::Failure { duration_ms }
                        });
                    });
                    return Ok(DispatchResult::Stream {
                        items: rx,
                        instance_id: reply_instance,
                    });
                }
                Err(e) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    cluster.balancer().on_end(&instance.id, false, duration_ms);
                    self.registry
                        .record_call(cluster_name, &instance.id, false, duration_ms);
                    permit.release(if e.counts_as_breaker_failure() {
                        CallOutcome::Failure { duration_ms }
                    } else {
                        CallOutcome::Cancelled
                    });

                    let channel_error = matches!(
                        e,
                        Error::ChannelConnectFailed { .. } | Error::ChannelClosed { .. }
                    );
                    if channel_error {
                        self.pool.discard(&instance.id);
                        if !channel_retry_used {
                            // One shot on a fresh instance; the connection
                            // never carried the request.
                            channel_retry_used = true;
                            avoid_instance = Some(instance.id.clone());
                            debug!(
                                cluster = cluster_name,
                                instance = %instance.id,
                                "channel failure, retrying on a fresh instance"
                            );
                            continue;
                        }
                        return Err(e);
                    }

                    if e.is_retryable() && route.idempotent && retries_done < max_retries {
                        if matches!(e, Error::GrpcResourceExhausted(_)) {
                            tokio::time::sleep(Duration::from_millis(
                                self.mcp.resource_exhausted_cooldown_ms,
                            ))
                            .await;
                        }
                        let delay = self
                            .backoff
                            .delay(retries_done)
                            .min(deadline.saturating_duration_since(Instant::now()));
                        retries_done += 1;
                        avoid_instance = Some(instance.id.clone());
                        warn!(
                            cluster = cluster_name,
                            attempt = retries_done,
                            kind = e.kind(),
                            "retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(e);
                }
            }
        }
    }

    async fn invoke(
        &self,
        cluster: &Arc<ClusterRuntime>,
        route: &ResolvedRoute,
        method_desc: &MethodDescriptor,
        request_doc: &Value,
        envelope: &RestEnvelope,
        instance: &bridge_core::types::ServiceInstance,
        deadline: Instant,
    ) -> Result<Invoked> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let channel_config = &cluster.config().channel;
        let handle = self.pool.acquire(instance, channel_config).await?;

        let mut grpc = tonic::client::Grpc::new(handle.channel())
            .max_decoding_message_size(channel_config.max_message_bytes)
            .max_encoding_message_size(channel_config.max_message_bytes);
        match channel_config.compression {
            Compression::Gzip => {
                grpc = grpc
                    .send_compressed(tonic::codec::CompressionEncoding::Gzip)
                    .accept_compressed(tonic::codec::CompressionEncoding::Gzip);
            }
            Compression::Deflate => {
                grpc = grpc
                    .send_compressed(tonic::codec::CompressionEncoding::Deflate)
                    .accept_compressed(tonic::codec::CompressionEncoding::Deflate);
            }
            Compression::None => {}
        }

        tokio::time::timeout(remaining, grpc.ready())
            .await
            .map_err(|_| Error::GrpcDeadlineExceeded)?
            .map_err(|e| Error::ChannelConnectFailed {
                instance: instance.id.clone(),
                detail: e.to_string(),
            })?;

        let path = http::uri::PathAndQuery::try_from(route.grpc_path())
            .map_err(|e| Error::Internal(format!("grpc path: {e}")))?;
        let codec = DynamicCodec::new(method_desc.output());

        match route.streaming {
            StreamingKind::Unary => {
                let message = map_to_message(request_doc, &method_desc.input(), &self.translate)?;
                let request = self.build_request(message, route, envelope, remaining)?;
                let response = tokio::time::timeout(remaining, grpc.unary(request, path, codec))
                    .await
                    .map_err(|_| Error::GrpcDeadlineExceeded)?
                    .map_err(map_status)?;
                let no_store = response
                    .metadata()
                    .get("cache-control")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.contains("no-store"))
                    .unwrap_or(false);
                Ok(Invoked::Unary {
                    message: response.into_inner(),
                    no_store,
                })
            }
            StreamingKind::ClientStream => {
                let messages =
                    rest_to_grpc_stream(route, envelope, &method_desc.input(), &self.translate)?;
                let stream = tokio_stream::iter(messages);
                let request = self.build_request(stream, route, envelope, remaining)?;
                let response = tokio::time::timeout(
                    remaining,
                    grpc.client_streaming(request, path, codec),
                )
                .await
                .map_err(|_| Error::GrpcDeadlineExceeded)?
                .map_err(map_status)?;
                Ok(Invoked::Unary {
                    message: response.into_inner(),
                    no_store: true,
                })
            }
            StreamingKind::ServerStream => {
                let message = map_to_message(request_doc, &method_desc.input(), &self.translate)?;
                let request = self.build_request(message, route, envelope, remaining)?;
                let response = tokio::time::timeout(
                    remaining,
                    grpc.server_streaming(request, path, codec),
                )
                .await
                .map_err(|_| Error::GrpcDeadlineExceeded)?
                .map_err(map_status)?;
                let mut streaming = response.into_inner();

                if envelope.accept_ndjson {
                    return Ok(Invoked::Streaming { streaming, handle });
                }

                let mut items = Vec::new();
                while items.len() < self.mcp.max_stream_items {
                    let per_message = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(per_message, streaming.message()).await {
                        Ok(Ok(Some(message))) => {
                            items.push(grpc_to_rest(&message, route, &self.translate)?);
                        }
                        Ok(Ok(None)) => break,
                        Ok(Err(status)) => return Err(map_status(status)),
                        Err(_) => return Err(Error::GrpcDeadlineExceeded),
                    }
                }
                Ok(Invoked::Collected { items })
            }
            StreamingKind::Bidi => unreachable!("rejected before invoke"),
        }
    }

    fn build_request<T>(
        &self,
        message: T,
        route: &ResolvedRoute,
        envelope: &RestEnvelope,
        remaining: Duration,
    ) -> Result<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        // Sets the grpc-timeout header from the dispatch deadline.
        request.set_timeout(remaining);
        for (name, value) in request_metadata(envelope) {
            let (Ok(key), Ok(value)) = (
                MetadataKey::from_bytes(name.as_bytes()),
                MetadataValue::try_from(value.as_str()),
            ) else {
                continue;
            };
            request.metadata_mut().insert(key, value);
        }
        if route.idempotent {
            request
                .metadata_mut()
                .insert("idempotent", MetadataValue::from_static("true"));
        }
        Ok(request)
    }

    fn healthy_instances(&self, cluster_name: &str) -> Vec<bridge_core::types::ServiceInstance> {
        // Both plaintext and TLS gRPC instances qualify; anything else is
        // not dialable from this plane.
        self.registry
            .discover(cluster_name, &BTreeSet::new(), true)
    }

    fn total_timeout(&self, cluster: &Arc<ClusterRuntime>, envelope: &RestEnvelope) -> Duration {
        let cluster_ms = cluster.config().timeout_ms(&self.mcp);
        let caller_ms = envelope.deadline_ms.unwrap_or(u64::MAX);
        Duration::from_millis(cluster_ms.min(caller_ms))
    }

    fn cache_key(
        &self,
        cluster: &Arc<ClusterRuntime>,
        route: &ResolvedRoute,
        envelope: &RestEnvelope,
        request_doc: &Value,
    ) -> Option<String> {
        if self.cache.is_none()
            || route.streaming != StreamingKind::Unary
            || !envelope.method.eq_ignore_ascii_case("GET")
        {
            return None;
        }
        Some(ResponseCache::key(
            cluster.name(),
            &route.grpc_path(),
            request_doc,
            envelope.authorization.as_deref(),
        ))
    }
}

enum Invoked {
    Unary {
        message: DynamicMessage,
        no_store: bool,
    },
    Collected {
        items: Vec<Value>,
    },
    Streaming {
        streaming: tonic::Streaming<DynamicMessage>,
        handle: crate::pool::ChannelHandle,
    },
}

fn map_status(status: tonic::Status) -> Error {
    match status.code() {
        Code::DeadlineExceeded => Error::GrpcDeadlineExceeded,
        Code::Unavailable => Error::GrpcUnavailable(status.message().to_string()),
        Code::ResourceExhausted => Error::GrpcResourceExhausted(status.message().to_string()),
        Code::InvalidArgument => Error::GrpcInvalidArgument(status.message().to_string()),
        Code::Cancelled => Error::Cancelled,
        code => Error::GrpcOther {
            code: format!("{code:?}"),
            message: status.message().to_string(),
        },
    }
}
