//! Per-request data exposed to conditions and templates.

use axum::http::{HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Immutable snapshot of one request.
///
/// Built once after the path and method have matched, dropped when the
/// response has been written.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: String,
    url: String,
    path: String,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HashMap<String, Vec<String>>,
    body: Vec<u8>,
    json: Option<Value>,
    document: Value,
}

/// JSON view of the context that expressions run against.
#[derive(Serialize)]
struct Document<'a> {
    params: &'a HashMap<String, String>,
    query: &'a HashMap<String, String>,
    headers: HashMap<&'a str, &'a str>,
    method: &'a str,
    url: &'a str,
    path: &'a str,
    body: String,
    json: &'a Option<Value>,
}

impl RequestContext {
    /// Build a context from the parts of an HTTP request.
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
        params: HashMap<String, String>,
    ) -> Self {
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        Self::new(
            method.as_str(),
            &url,
            flatten_headers(headers),
            body.to_vec(),
            params,
        )
    }

    /// Build a context from plain values. Header names are matched
    /// case-insensitively and every value of a repeated name is kept; the
    /// expression document shows the first one. The path part of `url` is
    /// percent-decoded.
    pub fn new(
        method: &str,
        url: &str,
        headers: impl IntoIterator<Item = (String, String)>,
        body: Vec<u8>,
        params: HashMap<String, String>,
    ) -> Self {
        let (raw_path, query_string) = match url.split_once('?') {
            Some((path, query)) => (path, query),
            None => (url, ""),
        };
        let path = decode_path(raw_path);

        let mut query = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
            query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }

        let mut header_map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            header_map.entry(name.to_lowercase()).or_default().push(value);
        }

        let json = serde_json::from_slice(&body).ok();

        let document = serde_json::to_value(Document {
            params: &params,
            query: &query,
            headers: header_map
                .iter()
                .filter_map(|(name, values)| Some((name.as_str(), values.first()?.as_str())))
                .collect(),
            method,
            url,
            path: &path,
            body: String::from_utf8_lossy(&body).into_owned(),
            json: &json,
        })
        .unwrap_or(Value::Null);

        Self {
            method: method.to_string(),
            url: url.to_string(),
            path,
            params,
            query,
            headers: header_map,
            body,
            json,
            document,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parsed body, if the body was valid JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    /// Case-insensitive header lookup (first value).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    /// Every value sent for a header, in arrival order.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_lowercase())
    }

    /// Root document for expression evaluation.
    pub fn document(&self) -> &Value {
        &self.document
    }
}

/// Percent-decode a request path. Invalid UTF-8 is replaced rather than
/// rejected.
pub fn decode_path(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Flatten a header map to name/value pairs, repeated names included.
fn flatten_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
