//! Mocker - configuration-driven HTTP mock server
//!
//! Answers HTTP requests from a declarative route table. Each route can be
//! guarded by conditions over the request, and its body and headers are
//! templates that interpolate request data.
//!
//! # Features
//!
//! - **Path Patterns**: literal segments, `*` wildcards, `{name}` captures
//! - **Conditions**: jq-flavoured expressions over the request
//! - **Templates**: `${ expression }` placeholders in bodies and headers
//! - **Hot Reload**: the route table is swapped atomically when the file changes
//!
//! # Example Configuration
//!
//! ```yaml
//! port: 8080
//! routes:
//!   /users/{id}:
//!     get:
//!       - name: admin
//!         conditions:
//!           - .params.id == "1"
//!         response: '{"id": 1, "role": "admin"}'
//!         headers:
//!           Content-Type: application/json
//!       - response: '{"id": ${.params.id}, "role": "user"}'
//!         headers:
//!           Content-Type: application/json
//!   /ping:
//!     get:
//!       - conditions:
//!           - header_eq("X-Env", "test")
//!         response: pong
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod expr;
pub mod matcher;
pub mod server;
pub mod template;
pub mod watcher;

pub use config::MockerConfig;
pub use dispatcher::Dispatcher;
pub use expr::{ExpressionEvaluator, QueryEvaluator};
pub use matcher::RouteTable;
pub use watcher::ReloadWatcher;
