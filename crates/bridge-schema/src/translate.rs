use crate::rename::{apply_renames, apply_reverse_renames, set_path};
use crate::routes::ResolvedRoute;
use base64::Engine;
use bridge_core::{Error, Result};
use bytes::Bytes;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde_json::{json, Map, Value};

/// Request body encoding accepted on the REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentKind {
    #[default]
    Json,
    Proto,
}

/// Everything the gateway extracts from one REST request before handing it
/// to the dispatcher.
#[derive(Debug, Clone)]
pub struct RestEnvelope {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub content_type: ContentKind,
    pub body: Bytes,
    /// Forwarded header subset (names lowercased).
    pub headers_subset: Vec<(String, String)>,
    pub request_id: String,
    pub deadline_ms: Option<u64>,
    pub accept_ndjson: bool,
    pub authorization: Option<String>,
}

impl RestEnvelope {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: Vec::new(),
            content_type: ContentKind::Json,
            body: Bytes::new(),
            headers_subset: Vec::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline_ms: None,
            accept_ndjson: false,
            authorization: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions {
    /// Unknown request fields fail with `schema.unknown_field` instead of
    /// being dropped.
    pub validate_schemas: bool,
    /// Include default-valued fields in JSON replies.
    pub emit_default_fields: bool,
}

/// Build the request document: parsed body, placeholder bindings, forward
/// renames, and the GET query merge, in that order.
pub fn build_request_map(route: &ResolvedRoute, envelope: &RestEnvelope) -> Result<Value> {
    let mut doc = match envelope.content_type {
        ContentKind::Json => {
            if envelope.body.is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_slice(&envelope.body)
                    .map_err(|e| Error::SchemaParse(format!("request body: {e}")))?
            }
        }
        ContentKind::Proto => {
            // Opaque passthrough: the target message carries the payload in
            // a raw_body bytes field.
            let encoded = base64::engine::general_purpose::STANDARD.encode(&envelope.body);
            json!({ "raw_body": encoded })
        }
    };
    if !doc.is_object() {
        return Err(Error::SchemaParse("request body must be a JSON object".into()));
    }

    for (field_path, value) in &route.bindings {
        set_path(&mut doc, field_path, Value::String(value.clone()));
    }

    apply_renames(&mut doc, &route.renames);

    if envelope.method.eq_ignore_ascii_case("GET") && !envelope.query.is_empty() {
        let mut params = Map::new();
        for (name, value) in &envelope.query {
            params.insert(name.clone(), Value::String(value.clone()));
        }
        doc.as_object_mut()
            .expect("checked above")
            .insert("query".to_string(), Value::Object(params));
    }

    Ok(doc)
}

/// Marshal a request document into the method's input message.
pub fn map_to_message(
    doc: &Value,
    descriptor: &MessageDescriptor,
    options: &TranslateOptions,
) -> Result<DynamicMessage> {
    let de_options = DeserializeOptions::new().deny_unknown_fields(options.validate_schemas);
    DynamicMessage::deserialize_with_options(descriptor.clone(), doc.clone(), &de_options)
        .map_err(classify_decode_error)
}

/// REST -> gRPC for a unary or server-stream call.
pub fn rest_to_grpc(
    route: &ResolvedRoute,
    envelope: &RestEnvelope,
    input: &MessageDescriptor,
    options: &TranslateOptions,
) -> Result<DynamicMessage> {
    let doc = build_request_map(route, envelope)?;
    map_to_message(&doc, input, options)
}

/// REST -> gRPC for a client-stream call: the body is a JSON array, one
/// message per element. Bindings and renames apply to every element.
pub fn rest_to_grpc_stream(
    route: &ResolvedRoute,
    envelope: &RestEnvelope,
    input: &MessageDescriptor,
    options: &TranslateOptions,
) -> Result<Vec<DynamicMessage>> {
    if envelope.content_type != ContentKind::Json {
        return Err(Error::SchemaParse(
            "client-stream requests require a JSON array body".into(),
        ));
    }
    let parsed: Value = serde_json::from_slice(&envelope.body)
        .map_err(|e| Error::SchemaParse(format!("request body: {e}")))?;
    let Value::Array(elements) = parsed else {
        return Err(Error::SchemaParse(
            "client-stream requests require a JSON array body".into(),
        ));
    };

    let mut messages = Vec::with_capacity(elements.len());
    for mut element in elements {
        if !element.is_object() {
            return Err(Error::SchemaParse("stream elements must be JSON objects".into()));
        }
        for (field_path, value) in &route.bindings {
            set_path(&mut element, field_path, Value::String(value.clone()));
        }
        apply_renames(&mut element, &route.renames);
        messages.push(map_to_message(&element, input, options)?);
    }
    Ok(messages)
}

/// gRPC reply -> response document with reverse renames applied.
pub fn grpc_to_rest(
    message: &DynamicMessage,
    route: &ResolvedRoute,
    options: &TranslateOptions,
) -> Result<Value> {
    let ser_options = SerializeOptions::new()
        .skip_default_fields(!options.emit_default_fields)
        .use_proto_field_name(true);
    let mut doc = message
        .serialize_with_options(serde_json::value::Serializer, &ser_options)
        .map_err(|e| Error::Internal(format!("reply marshalling: {e}")))?;
    apply_reverse_renames(&mut doc, &route.renames);
    Ok(doc)
}

/// The success envelope wrapped around every JSON reply.
pub fn success_envelope(
    data: Value,
    request_id: &str,
    execution_time_ms: u64,
    instance_id: &str,
) -> Value {
    json!({
        "status": "success",
        "data": data,
        "meta": {
            "request_id": request_id,
            "execution_time_ms": execution_time_ms,
            "instance_id": instance_id,
        }
    })
}

/// gRPC metadata attached to every outbound call.
pub fn request_metadata(envelope: &RestEnvelope) -> Vec<(String, String)> {
    let mut meta = vec![
        ("x-bridge-request-id".to_string(), envelope.request_id.clone()),
        ("x-bridge-rest-method".to_string(), envelope.method.clone()),
        ("x-bridge-rest-path".to_string(), envelope.path.clone()),
        (
            "x-bridge-ts".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ),
    ];
    for (name, value) in &envelope.headers_subset {
        meta.push((format!("x-bridge-hdr-{name}"), value.clone()));
    }
    meta
}

fn classify_decode_error(e: serde_json::Error) -> Error {
    let text = e.to_string();
    if text.contains("unknown field") {
        Error::SchemaUnknownField(text)
    } else if text.contains("invalid type") || text.contains("expected") {
        Error::SchemaFieldTypeMismatch(text)
    } else {
        Error::SchemaParse(text)
    }
}
