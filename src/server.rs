//! HTTP server wiring.

use crate::dispatcher::Dispatcher;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Build the catch-all router: every path and method goes to the dispatcher.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", any(mock_handler))
        .route("/{*path}", any(mock_handler))
        .with_state(dispatcher)
        // the dispatcher enforces its own body limit
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
}

async fn mock_handler(State(dispatcher): State<Dispatcher>, request: Request<Body>) -> Response {
    dispatcher.handle(request).await
}

/// Serve until the process is terminated.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Mock server listening");
    axum::serve(listener, router(dispatcher)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockerConfig;
    use crate::matcher::RouteTable;
    use arc_swap::ArcSwap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let config = MockerConfig::from_yaml("routes:\n  /:\n    get:\n      - response: root\n").unwrap();
        let dispatcher = Dispatcher::new(Arc::new(ArcSwap::from_pointee(RouteTable::new(config.routes))));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, dispatcher));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{raw}");
        assert!(raw.ends_with("root"), "{raw}");
        server.abort();
    }
}
