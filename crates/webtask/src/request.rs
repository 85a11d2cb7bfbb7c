//! Request construction
//!
//! A [`RequestBuilder`] collects method, path, query, headers and body by
//! value and produces an immutable [`Request`]. Once built, a request cannot
//! change, so a transfer in flight always sees exactly what was started.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const XML: &str = "text/xml";
    pub const FORM_ENCODED: &str = "application/x-www-form-urlencoded";
}

/// How body parameters are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterEncoding {
    /// `application/x-www-form-urlencoded`
    #[default]
    Percent,
    Json,
}

impl ParameterEncoding {
    /// Encode parameters into a request body
    pub fn encode_body(&self, parameters: &[(String, JsonValue)]) -> ClientResult<Bytes> {
        match self {
            ParameterEncoding::Percent => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (name, value) in parameters {
                    serializer.append_pair(name, &plain_value(value));
                }
                Ok(Bytes::from(serializer.finish()))
            }
            ParameterEncoding::Json => {
                let object: serde_json::Map<String, JsonValue> = parameters.iter().cloned().collect();
                Ok(Bytes::from(serde_json::to_vec(&JsonValue::Object(object))?))
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ParameterEncoding::Percent => content_type::FORM_ENCODED,
            ParameterEncoding::Json => content_type::JSON,
        }
    }
}

/// How a request may use cached responses. Transports express this as a
/// `Cache-Control` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Whatever the protocol and the server's headers allow
    #[default]
    UseProtocol,
    /// Revalidate with the origin before using a stored response
    ReloadIgnoringLocal,
    /// Bypass every cache, local and intermediate
    ReloadIgnoringLocalAndRemote,
    /// Accept a stored response however stale, else load
    ReturnCacheElseLoad,
    /// Only a stored response; never load from the origin
    ReturnCacheDontLoad,
}

impl CachePolicy {
    /// Directive sent as `Cache-Control`, if any
    pub fn cache_control(&self) -> Option<&'static str> {
        match self {
            CachePolicy::UseProtocol => None,
            CachePolicy::ReloadIgnoringLocal => Some("no-cache"),
            CachePolicy::ReloadIgnoringLocalAndRemote => Some("no-cache, no-store"),
            CachePolicy::ReturnCacheElseLoad => Some("max-stale"),
            CachePolicy::ReturnCacheDontLoad => Some("only-if-cached, max-stale"),
        }
    }
}

fn plain_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Append `path` to `base` as a path component.
///
/// Leading slashes on `path` are ignored, so `"/posts"` and `"posts"` both
/// land under the base path. A `path` that is itself an absolute URL
/// replaces the base entirely.
pub fn join_path(base: &Url, path: &str) -> ClientResult<Url> {
    if let Ok(absolute) = Url::parse(path) {
        if absolute.has_host() {
            return Ok(absolute);
        }
    }

    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Ok(base.clone());
    }

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(relative).map_err(|e| {
        ClientError::InvalidUrl(format!("Failed to join '{}' with '{}': {}", base, path, e))
    })
}

/// Parse a base URL, rejecting anything without a host
pub fn parse_base_url(base_url: &str) -> ClientResult<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| ClientError::InvalidUrl(format!("Invalid base URL '{}': {}", base_url, e)))?;
    if !url.has_host() {
        return Err(ClientError::InvalidUrl(format!("Base URL '{}' has no host", base_url)));
    }
    Ok(url)
}

/// Wrap an XML fragment in a SOAP 1.1 envelope
pub fn soap_envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            "<soap:Body>{}</soap:Body></soap:Envelope>"
        ),
        body
    )
}

/// A fully assembled, immutable request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub cache_policy: CachePolicy,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, headers: HeaderMap::new(), body: None, cache_policy: CachePolicy::default() }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }
}

/// By-value request builder
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    base: Url,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    body_params: Vec<(String, JsonValue)>,
    encoding: ParameterEncoding,
    cache_policy: CachePolicy,
    deferred_error: Option<ClientError>,
}

impl RequestBuilder {
    pub fn new(method: Method, base: Url) -> Self {
        Self {
            method,
            base,
            path: String::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            body_params: Vec::new(),
            encoding: ParameterEncoding::default(),
            cache_policy: CachePolicy::default(),
            deferred_error: None,
        }
    }

    /// Append a path component
    pub fn path(mut self, path: impl AsRef<str>) -> Self {
        let path = path.as_ref().trim_matches('/');
        if !path.is_empty() {
            if !self.path.is_empty() {
                self.path.push('/');
            }
            self.path.push_str(path);
        }
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn query_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    /// Set a header, replacing an earlier value with the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        headers
            .into_iter()
            .fold(self, |builder, (name, value)| builder.header(name, value))
    }

    pub(crate) fn default_header(self, name: &str, value: &str) -> Self {
        if self.has_header(name) {
            self
        } else {
            self.header(name, value)
        }
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Raw body. Takes precedence over body parameters.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.body = Some(Bytes::from(bytes));
                self.header(CONTENT_TYPE.as_str(), content_type::JSON)
            }
            Err(err) => {
                self.deferred_error.get_or_insert(ClientError::Serialization(err));
                self
            }
        }
    }

    pub fn form_param(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.body_params.push((name.into(), value.into()));
        self
    }

    pub fn form<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        self.body_params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.encoding = encoding;
        if encoding == ParameterEncoding::Json {
            self = self.header(CONTENT_TYPE.as_str(), content_type::JSON);
        }
        self
    }

    /// Wrap `xml` in a SOAP envelope and use it as the body
    pub fn soap(self, xml: &str) -> Self {
        self.header(CONTENT_TYPE.as_str(), content_type::XML)
            .body(soap_envelope(xml))
    }

    pub fn build(self) -> ClientResult<Request> {
        if let Some(err) = self.deferred_error {
            return Err(err);
        }

        let mut url = join_path(&self.base, &self.path)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::InvalidHeader(format!("{}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::InvalidHeader(format!("{}: {}", name, e)))?;
            headers.insert(header_name, header_value);
        }

        let mut body = None;
        if !self.body_params.is_empty() {
            body = Some(self.encoding.encode_body(&self.body_params)?);
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.encoding.content_type()));
            }
        }
        if let Some(raw) = self.body {
            body = Some(raw);
        }

        Ok(Request { method: self.method, url, headers, body, cache_policy: self.cache_policy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base(url: &str) -> Url {
        parse_base_url(url).unwrap()
    }

    #[test]
    fn test_join_appends_path_components() {
        let api = base("https://api.example.com/v1");
        assert_eq!(join_path(&api, "users").unwrap().as_str(), "https://api.example.com/v1/users");
        assert_eq!(join_path(&api, "/users").unwrap().as_str(), "https://api.example.com/v1/users");
        assert_eq!(
            join_path(&base("https://api.example.com/v1/"), "users/123").unwrap().as_str(),
            "https://api.example.com/v1/users/123"
        );
        assert_eq!(join_path(&api, "").unwrap().as_str(), "https://api.example.com/v1");
    }

    #[test]
    fn test_join_encodes_and_accepts_absolute_urls() {
        let api = base("https://api.example.com");
        assert_eq!(
            join_path(&api, "search/projects with spaces").unwrap().as_str(),
            "https://api.example.com/search/projects%20with%20spaces"
        );
        assert_eq!(
            join_path(&api, "https://other.example.com/file.zip").unwrap().as_str(),
            "https://other.example.com/file.zip"
        );
    }

    #[test]
    fn test_invalid_base_urls() {
        assert!(parse_base_url("not-a-url").is_err());
        assert!(parse_base_url("").is_err());
        assert!(parse_base_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_builder_query_and_headers() {
        let request = RequestBuilder::new(Method::GET, base("http://localhost:3000"))
            .path("posts")
            .path("/1/")
            .query("expand", "author")
            .query("page", 2)
            .header("Accept", "text/plain")
            .header("accept", "application/json")
            .build()
            .unwrap();

        assert_eq!(request.url.as_str(), "http://localhost:3000/posts/1?expand=author&page=2");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers["accept"], "application/json");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_form_body_defaults_content_type() {
        let request = RequestBuilder::new(Method::POST, base("http://localhost"))
            .form([("title", json!("a b")), ("id", json!(3))])
            .build()
            .unwrap();
        assert_eq!(request.content_type(), Some(content_type::FORM_ENCODED));
        assert_eq!(request.body.unwrap().as_ref(), b"title=a+b&id=3");
    }

    #[test]
    fn test_json_encoded_params() {
        let request = RequestBuilder::new(Method::POST, base("http://localhost"))
            .form_param("title", "hello")
            .encoding(ParameterEncoding::Json)
            .build()
            .unwrap();
        assert_eq!(request.content_type(), Some(content_type::JSON));
        let body: JsonValue = serde_json::from_slice(&request.body.unwrap()).unwrap();
        assert_eq!(body, json!({"title": "hello"}));
    }

    #[test]
    fn test_raw_body_overrides_params() {
        let request = RequestBuilder::new(Method::PUT, base("http://localhost"))
            .form_param("ignored", 1)
            .body("raw")
            .build()
            .unwrap();
        assert_eq!(request.body.unwrap().as_ref(), b"raw");
    }

    #[test]
    fn test_json_body() {
        let request = RequestBuilder::new(Method::POST, base("http://localhost"))
            .json(&json!({"id": 1, "author": "typicode"}))
            .build()
            .unwrap();
        assert_eq!(request.content_type(), Some(content_type::JSON));
        let body: JsonValue = serde_json::from_slice(&request.body.unwrap()).unwrap();
        assert_eq!(body["author"], "typicode");
    }

    #[test]
    fn test_soap_body() {
        let request = RequestBuilder::new(Method::POST, base("http://www.webservicex.net"))
            .soap("<GetCitiesByCountry><CountryName>Turkey</CountryName></GetCitiesByCountry>")
            .build()
            .unwrap();
        assert_eq!(request.content_type(), Some(content_type::XML));
        let body = String::from_utf8(request.body.unwrap().to_vec()).unwrap();
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<soap:Body><GetCitiesByCountry>"));
        assert!(body.ends_with("</soap:Body></soap:Envelope>"));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let result = RequestBuilder::new(Method::GET, base("http://localhost"))
            .header("bad header", "x")
            .build();
        assert!(matches!(result, Err(ClientError::InvalidHeader(_))));
    }

    #[test]
    fn test_cache_policy_defaults_and_directives() {
        let request = RequestBuilder::new(Method::GET, base("http://localhost")).build().unwrap();
        assert_eq!(request.cache_policy, CachePolicy::UseProtocol);
        assert_eq!(request.cache_policy.cache_control(), None);

        let request = RequestBuilder::new(Method::GET, base("http://localhost"))
            .cache_policy(CachePolicy::ReloadIgnoringLocalAndRemote)
            .build()
            .unwrap();
        assert_eq!(request.cache_policy.cache_control(), Some("no-cache, no-store"));
        assert_eq!(CachePolicy::ReturnCacheDontLoad.cache_control(), Some("only-if-cached, max-stale"));

        let parsed: CachePolicy = serde_json::from_str(r#""reload_ignoring_local""#).unwrap();
        assert_eq!(parsed, CachePolicy::ReloadIgnoringLocal);
    }
}
