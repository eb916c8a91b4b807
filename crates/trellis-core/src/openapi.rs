//! OpenAPI resources.
//!
//! `import petstore from "petstore.json" with {base_url: ...}` loads a JSON
//! OpenAPI document and exposes one method per `operationId`:
//!
//! ```text
//! petstore.getPet(42)                  # path parameters, positionally
//! petstore.listPets(limit: 3)          # query/header parameters by name
//! petstore.createPet({name: "rex"})    # leftover positional is the body
//! ```
//!
//! Options: `base_url` (else `servers[0].url`), `timeout` (ms), `auth` (a
//! bearer token string, `{type: "bearer", token}` or `{header, value}`) and
//! `headers`. Every problem with the document or the options is a
//! [`ProviderError::Configuration`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::http::{append_query, encode_body, encode_component, is_absolute, join_url, send_with_timeout, HttpRequest, HttpTransport};
use crate::provider::{CallArgs, ProviderError, ServiceProvider};
use crate::value::Value;

const HTTP_METHODS: [&str; 7] = ["get", "put", "post", "delete", "patch", "head", "options"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub method: String,
    pub path: String,
    pub params: Vec<Parameter>,
    pub has_body: bool,
}

impl Operation {
    /// Path parameters in the order they appear in the template.
    fn path_params(&self) -> Vec<&Parameter> {
        let mut params: Vec<(usize, &Parameter)> = self
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
            .map(|p| (self.path.find(&format!("{{{}}}", p.name)).unwrap_or(usize::MAX), p))
            .collect();
        params.sort_by_key(|(pos, _)| *pos);
        params.into_iter().map(|(_, p)| p).collect()
    }
}

pub struct OpenApiProvider {
    namespace: String,
    base_url: String,
    timeout_ms: u64,
    headers: Vec<(String, String)>,
    operations: BTreeMap<String, Operation>,
    transport: Arc<dyn HttpTransport>,
}

impl OpenApiProvider {
    /// Reads and registers the document at `path`.
    pub fn load(
        namespace: &str,
        path: &Path,
        options: Option<&Value>,
        default_timeout_ms: u64,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ProviderError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::Configuration(format!("cannot read OpenAPI document '{}': {}", path.display(), e))
        })?;
        let document: Json = serde_json::from_str(&text).map_err(|e| {
            ProviderError::Configuration(format!("invalid OpenAPI document '{}': {}", path.display(), e))
        })?;
        Self::from_document(namespace, &document, options, default_timeout_ms, transport)
    }

    pub fn from_document(
        namespace: &str,
        document: &Json,
        options: Option<&Value>,
        default_timeout_ms: u64,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ProviderError> {
        let options = match options {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(ProviderError::Configuration(format!(
                    "import options must be an object, got {}",
                    other.type_name()
                )))
            }
        };

        let operations = parse_operations(document)?;
        let base_url = resolve_base_url(document, options.get("base_url"))?;
        let timeout_ms = match options.get("timeout") {
            None => default_timeout_ms,
            Some(value) => value
                .as_i64()
                .filter(|ms| *ms > 0)
                .map(|ms| ms as u64)
                .ok_or_else(|| ProviderError::Configuration("timeout must be a positive integer".to_string()))?,
        };

        let mut headers = Vec::new();
        if let Some(auth) = options.get("auth") {
            headers.push(auth_header(auth)?);
        }
        match options.get("headers") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => headers.extend(map.iter().map(|(k, v)| (k.clone(), v.as_text()))),
            Some(other) => {
                return Err(ProviderError::Configuration(format!(
                    "headers must be an object, got {}",
                    other.type_name()
                )))
            }
        }

        Ok(Self {
            namespace: namespace.to_string(),
            base_url,
            timeout_ms,
            headers,
            operations,
            transport,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.get(id)
    }

    fn build_request(&self, op: &Operation, args: &CallArgs) -> Result<HttpRequest, ProviderError> {
        let mut positional = args.positional.iter();
        let mut path = op.path.clone();
        for param in op.path_params() {
            let value = match args.named(&param.name) {
                Some(v) => Some(v),
                None => positional.next(),
            };
            match value {
                Some(v) => path = path.replace(&format!("{{{}}}", param.name), &encode_component(&v.as_text())),
                None => {
                    return Err(ProviderError::InvalidArguments(format!(
                        "{} is missing path parameter '{}'",
                        op.id, param.name
                    )))
                }
            }
        }

        let mut query = BTreeMap::new();
        let mut headers = self.headers.clone();
        for param in op.params.iter().filter(|p| p.location != ParamLocation::Path) {
            match args.named(&param.name) {
                Some(Value::Null) | None if param.required => {
                    return Err(ProviderError::InvalidArguments(format!(
                        "{} is missing required parameter '{}'",
                        op.id, param.name
                    )))
                }
                Some(Value::Null) | None => {}
                Some(value) => match param.location {
                    ParamLocation::Query => {
                        query.insert(param.name.clone(), value.clone());
                    }
                    ParamLocation::Header => headers.push((param.name.clone(), value.as_text())),
                    ParamLocation::Path => {}
                },
            }
        }

        for name in args.named.keys() {
            let known = name == "body" || op.params.iter().any(|p| &p.name == name);
            if !known {
                return Err(ProviderError::InvalidArguments(format!(
                    "{} has no parameter '{}'",
                    op.id, name
                )));
            }
        }

        let body = args.named("body").or_else(|| positional.next());
        if positional.next().is_some() {
            return Err(ProviderError::InvalidArguments(format!("too many arguments for {}", op.id)));
        }
        if body.is_some() && !op.has_body {
            return Err(ProviderError::InvalidArguments(format!("{} does not take a request body", op.id)));
        }
        let body = encode_body(body, &mut headers);

        let url = append_query(&join_url(&self.base_url, &path), Some(&Value::Object(query)))?;
        Ok(HttpRequest {
            method: op.method.to_ascii_uppercase(),
            url,
            headers,
            body,
            timeout_ms: self.timeout_ms,
        })
    }
}

#[async_trait]
impl ServiceProvider for OpenApiProvider {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn methods(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    fn supports(&self, method: &str) -> bool {
        self.operations.contains_key(method)
    }

    async fn invoke(&self, method: &str, args: CallArgs) -> Result<Value, ProviderError> {
        let op = self.operations.get(method).ok_or_else(|| ProviderError::NotSupported {
            namespace: self.namespace.clone(),
            method: method.to_string(),
        })?;
        let request = self.build_request(op, &args)?;
        let response = send_with_timeout(self.transport.as_ref(), request).await?;
        Ok(response.to_value())
    }

    fn records_response(&self) -> bool {
        true
    }
}

fn parse_operations(document: &Json) -> Result<BTreeMap<String, Operation>, ProviderError> {
    let paths = document
        .get("paths")
        .and_then(Json::as_object)
        .ok_or_else(|| ProviderError::Configuration("OpenAPI document has no 'paths' object".to_string()))?;

    let mut operations = BTreeMap::new();
    for (path, item) in paths {
        let shared = item.get("parameters");
        for method in HTTP_METHODS {
            let Some(op) = item.get(method) else { continue };
            let Some(id) = op.get("operationId").and_then(Json::as_str) else {
                tracing::debug!(path = %path, method, "skipping operation without operationId");
                continue;
            };
            let mut params = Vec::new();
            for list in [shared, op.get("parameters")].into_iter().flatten() {
                for raw in list.as_array().into_iter().flatten() {
                    let param = parse_parameter(document, raw)?;
                    if let Some(param) = param {
                        params.retain(|p: &Parameter| p.name != param.name || p.location != param.location);
                        params.push(param);
                    }
                }
            }
            operations.insert(
                id.to_string(),
                Operation {
                    id: id.to_string(),
                    method: method.to_string(),
                    path: path.clone(),
                    params,
                    has_body: op.get("requestBody").is_some(),
                },
            );
        }
    }
    Ok(operations)
}

/// `None` for parameter kinds scripts cannot set (cookies).
fn parse_parameter(document: &Json, raw: &Json) -> Result<Option<Parameter>, ProviderError> {
    let param = match raw.get("$ref").and_then(Json::as_str) {
        Some(reference) => resolve_ref(document, reference)?,
        None => raw,
    };
    let name = param
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| ProviderError::Configuration("parameter without a name".to_string()))?;
    let location = match param.get("in").and_then(Json::as_str) {
        Some("path") => ParamLocation::Path,
        Some("query") => ParamLocation::Query,
        Some("header") => ParamLocation::Header,
        _ => return Ok(None),
    };
    let required = location == ParamLocation::Path || param.get("required").and_then(Json::as_bool).unwrap_or(false);
    Ok(Some(Parameter {
        name: name.to_string(),
        location,
        required,
    }))
}

fn resolve_ref<'a>(document: &'a Json, reference: &str) -> Result<&'a Json, ProviderError> {
    reference
        .strip_prefix('#')
        .and_then(|pointer| document.pointer(pointer))
        .ok_or_else(|| ProviderError::Configuration(format!("cannot resolve reference '{}'", reference)))
}

fn resolve_base_url(document: &Json, option: Option<&Value>) -> Result<String, ProviderError> {
    match option {
        Some(Value::String(url)) => return Ok(url.clone()),
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(ProviderError::Configuration(format!(
                "base_url must be a string, got {}",
                other.type_name()
            )))
        }
    }
    let server = document.pointer("/servers/0/url").and_then(Json::as_str);
    match server {
        Some(url) if is_absolute(url) => Ok(url.to_string()),
        Some(url) => Err(ProviderError::Configuration(format!(
            "server URL '{}' is relative; pass base_url",
            url
        ))),
        None => Err(ProviderError::Configuration(
            "no base URL: pass base_url or declare servers in the document".to_string(),
        )),
    }
}

fn auth_header(auth: &Value) -> Result<(String, String), ProviderError> {
    let bearer = |token: &str| ("Authorization".to_string(), format!("Bearer {}", token));
    match auth {
        Value::String(token) => Ok(bearer(token)),
        Value::Object(map) => {
            if let (Some(header), Some(value)) = (map.get("header"), map.get("value")) {
                return Ok((header.as_text(), value.as_text()));
            }
            match (map.get("type").and_then(Value::as_str), map.get("token")) {
                (Some(kind), Some(token)) if kind.eq_ignore_ascii_case("bearer") => Ok(bearer(&token.as_text())),
                _ => Err(ProviderError::Configuration(
                    "auth must be a token, {type: \"bearer\", token} or {header, value}".to_string(),
                )),
            }
        }
        other => Err(ProviderError::Configuration(format!(
            "auth must be a string or object, got {}",
            other.type_name()
        ))),
    }
}
