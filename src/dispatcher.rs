//! Request dispatch.
//!
//! Resolves an incoming request against the active route table and turns
//! the selected route into an HTTP response.

use crate::config::Route;
use crate::context::{decode_path, RequestContext};
use crate::matcher::RouteTable;
use crate::template::TemplateEngine;
use arc_swap::ArcSwap;
use axum::body::{to_bytes, Body};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default limit on buffered request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Characters of the response body shown in the match log line.
const PREVIEW_CHARS: usize = 20;

/// Shared handle to the active route table.
pub type SharedRoutes = Arc<ArcSwap<RouteTable>>;

/// Why a request fell through to 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
    Url,
    Method,
    Conditions,
}

impl Miss {
    fn message(self) -> &'static str {
        match self {
            Miss::Url => "URL not matched",
            Miss::Method => "method not matched",
            Miss::Conditions => "conditions not matched",
        }
    }
}

/// A rendered mock response.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub route: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Per-request dispatcher over a hot-swappable route table.
#[derive(Clone)]
pub struct Dispatcher {
    routes: SharedRoutes,
    templates: TemplateEngine,
    body_limit: usize,
}

impl Dispatcher {
    pub fn new(routes: SharedRoutes) -> Self {
        Self::with_engine(routes, TemplateEngine::new())
    }

    pub fn with_engine(routes: SharedRoutes, templates: TemplateEngine) -> Self {
        Self {
            routes,
            templates,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Limit the number of request body bytes buffered per request.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// The shared table handle, for the reload watcher.
    pub fn routes(&self) -> &SharedRoutes {
        &self.routes
    }

    /// Handle one HTTP request.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        // one snapshot for the whole request, even if a reload lands mid-way
        let table = self.routes.load_full();
        let (parts, body) = request.into_parts();
        let url = decode_path(parts.uri.path());
        let method = parts.method.as_str().to_lowercase();

        let Some(found) = table.find(&url) else {
            return not_found(&url, &method, Miss::Url);
        };
        let Some(routes) = found.routes(&method) else {
            return not_found(&url, &method, Miss::Method);
        };

        let body = match to_bytes(body, self.body_limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let too_large = std::error::Error::source(&e)
                    .is_some_and(|source| source.is::<http_body_util::LengthLimitError>());
                let status = if too_large {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                warn!(url = %url, method = %method, error = %e, "Failed to read request body");
                return plain(status, status.canonical_reason().unwrap_or_default());
            }
        };

        let context =
            RequestContext::from_parts(&parts.method, &parts.uri, &parts.headers, &body, found.params);

        match self.select(routes, &context) {
            Some(route) => {
                let rendered = self.render(route, &context);
                log_match(&url, &method, route, &rendered);
                into_response(rendered)
            }
            None => not_found(&url, &method, Miss::Conditions),
        }
    }

    /// First route, in configured order, whose conditions all hold.
    pub fn select<'r>(&self, routes: &'r [Route], context: &RequestContext) -> Option<&'r Route> {
        routes
            .iter()
            .find(|route| self.templates.conditions_hold(&route.conditions, context))
    }

    /// Render a route's status, headers and body.
    pub fn render(&self, route: &Route, context: &RequestContext) -> RenderedResponse {
        let body = self.templates.render(&route.response, context);
        let headers = route
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), self.templates.render(value, context)))
            .collect();

        RenderedResponse {
            route: route.display_name().to_string(),
            status: route.status(),
            headers,
            body,
        }
    }
}

fn log_match(url: &str, method: &str, route: &Route, rendered: &RenderedResponse) {
    if !route.conditions.is_empty() {
        debug!(route = %rendered.route, conditions = ?route.conditions, "Route conditions");
    }
    if !route.headers.is_empty() {
        debug!(route = %rendered.route, headers = ?route.headers, "Route headers");
    }
    info!(
        url = %url,
        method = %method,
        route = %rendered.route,
        status_code = rendered.status,
        response = %preview(&rendered.body),
        "Route matched"
    );
}

/// First [`PREVIEW_CHARS`] characters of a body, with `...` if truncated.
pub fn preview(body: &str) -> String {
    match body.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

fn into_response(rendered: RenderedResponse) -> Response {
    let mut response = Response::new(Body::from(rendered.body));

    // headers first, then status and body
    for (name, value) in &rendered.headers {
        let header = match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(header), Ok(value)) => (header, value),
            _ => {
                warn!(route = %rendered.route, header = %name, value = %value, "Skipping invalid header");
                continue;
            }
        };
        debug!(header = %name, value = %value, "Header set");
        response.headers_mut().insert(header.0, header.1);
    }

    *response.status_mut() = StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::OK);
    response
}

fn not_found(url: &str, method: &str, miss: Miss) -> Response {
    info!(url = %url, method = %method, "{}", miss.message());
    plain(StatusCode::NOT_FOUND, "404 page not found\n")
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockerConfig;

    fn dispatcher(yaml: &str) -> Dispatcher {
        let config = MockerConfig::from_yaml(yaml).unwrap();
        let table = RouteTable::new(config.routes);
        Dispatcher::new(Arc::new(ArcSwap::from_pointee(table)))
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(dispatcher: &Dispatcher, request: Request<Body>) -> (StatusCode, String) {
        let response = dispatcher.handle(request).await;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    const ROUTES: &str = r#"
routes:
  /users/{id}:
    get:
      - response: "user ${.params.id}"
  /ping:
    GET:
      - name: test env
        conditions:
          - header_eq("X-Env", "test")
        response: pong
        headers:
          X-Route: "${.method | lower}"
  /orders:
    post:
      - name: bulk
        conditions:
          - .json.items | length > 1
        code: 202
        response: "accepted ${.json.items | length}"
      - name: single
        code: 201
        response: created
      - name: unreachable
        response: never
"#;

    #[tokio::test]
    async fn test_path_param_response() {
        let d = dispatcher(ROUTES);
        let (status, body) = send(&d, request("GET", "/users/42", &[], "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "user 42");
    }

    #[tokio::test]
    async fn test_header_condition() {
        let d = dispatcher(ROUTES);

        let (status, body) = send(&d, request("GET", "/ping", &[], "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 page not found\n");

        let response = d.handle(request("GET", "/ping", &[("x-env", "TEST")], "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-route"], "get");
    }

    #[tokio::test]
    async fn test_percent_encoded_path() {
        let d = dispatcher(
            "routes:\n  /users/{id}:\n    get:\n      - response: \"user ${.params.id}\"\n  /files/my report:\n    get:\n      - response: \"${.path}\"\n",
        );

        let (status, body) = send(&d, request("GET", "/users/john%20doe", &[], "")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "user john doe"));

        let (status, body) = send(&d, request("GET", "/files/my%20report", &[], "")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "/files/my report"));
    }

    #[tokio::test]
    async fn test_repeated_header_any_value_matches() {
        let d = dispatcher(ROUTES);
        let (status, body) = send(
            &d,
            request("GET", "/ping", &[("x-env", "prod"), ("x-env", "test")], ""),
        )
        .await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "pong"));
    }

    #[tokio::test]
    async fn test_unknown_url_and_method() {
        let d = dispatcher(ROUTES);
        let (status, _) = send(&d, request("GET", "/unknown", &[], "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&d, request("DELETE", "/users/42", &[], "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_first_matching_route_wins() {
        let d = dispatcher(ROUTES);

        let (status, body) =
            send(&d, request("POST", "/orders", &[], r#"{"items":[1,2,3]}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, "accepted 3");

        let (status, body) = send(&d, request("POST", "/orders", &[], r#"{"items":[1]}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "created");

        // non-JSON body: .json is null, the first condition is false
        let (status, _) = send(&d, request("POST", "/orders", &[], "plain")).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let d = dispatcher(ROUTES).with_body_limit(4);
        let (status, _) = send(&d, request("POST", "/orders", &[], "0123456789")).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_invalid_rendered_header_is_skipped() {
        let d = dispatcher(
            r#"
routes:
  /h:
    get:
      - response: ok
        headers:
          X-Bad: "line\nbreak"
          X-Good: fine
"#,
        );
        let response = d.handle(request("GET", "/h", &[], "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-bad").is_none());
        assert_eq!(response.headers()["x-good"], "fine");
    }

    #[tokio::test]
    async fn test_snapshot_swap() {
        let d = dispatcher(ROUTES);
        let (status, _) = send(&d, request("GET", "/new", &[], "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let next = MockerConfig::from_yaml("routes:\n  /new:\n    get:\n      - response: fresh\n").unwrap();
        d.routes().store(Arc::new(RouteTable::new(next.routes)));

        let (status, body) = send(&d, request("GET", "/new", &[], "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "fresh");
    }

    #[test]
    fn test_select_and_render() {
        let d = dispatcher(ROUTES);
        let table = d.routes().load();
        let found = table.find("/orders").unwrap();
        let routes = found.routes("POST").unwrap();
        let ctx = RequestContext::new("POST", "/orders", Vec::new(), b"{}".to_vec(), found.params.clone());

        let route = d.select(routes, &ctx).unwrap();
        assert_eq!(route.display_name(), "single");

        let rendered = d.render(route, &ctx);
        assert_eq!(rendered.status, 201);
        assert_eq!(rendered.body, "created");
        assert!(rendered.headers.is_empty());
    }

    #[test]
    fn test_unconditional_route_always_matches() {
        let d = dispatcher(ROUTES);
        let table = d.routes().load();
        let found = table.find("/users/1").unwrap();
        let ctx = RequestContext::new("GET", "/users/1", Vec::new(), Vec::new(), found.params.clone());
        assert!(d.select(found.routes("get").unwrap(), &ctx).is_some());
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("exactly twenty chars"), "exactly twenty chars");
        assert_eq!(preview("this body is longer than twenty"), "this body is longer ...");
        assert_eq!(preview("ééééééééééééééééééééé"), "éééééééééééééééééééé...");
    }
}
