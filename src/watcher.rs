//! Configuration loading and hot reload.
//!
//! The watcher polls the configuration file's size and modification time
//! and, when either changes, loads a fresh route table and publishes it
//! with a single atomic swap. Requests already in flight keep the table
//! they started with.

use crate::config::{ConfigError, MockerConfig};
use crate::dispatcher::SharedRoutes;
use crate::matcher::RouteTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default polling interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Load a route table from a configuration file.
pub fn load(path: &Path) -> Result<RouteTable, ConfigError> {
    let config = MockerConfig::from_file(path)?;
    log_routes(&config);
    Ok(RouteTable::new(config.routes))
}

/// Emit one debug line per loaded route.
pub fn log_routes(config: &MockerConfig) {
    for (url, methods) in &config.routes {
        for (method, routes) in methods {
            for route in routes {
                debug!(
                    url = %url,
                    method = %method,
                    conditions = ?route.conditions,
                    code = route.status(),
                    "{} loaded",
                    route.display_name()
                );
            }
        }
    }
}

/// What the file looked like at the last check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileSignature {
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Reloaded,
    /// The file changed but could not be loaded; the old table stays active.
    Failed,
    /// The file could not be stat'ed.
    Missing,
}

/// Polls a configuration file and swaps in new route tables.
pub struct ReloadWatcher {
    path: PathBuf,
    routes: SharedRoutes,
    interval: Duration,
    port: String,
    signature: Option<FileSignature>,
}

impl ReloadWatcher {
    /// Create a watcher for `path`. `port` is the port the file named when
    /// it was last loaded. Without a baseline the first poll reloads.
    pub fn new(path: &Path, routes: SharedRoutes, port: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            routes,
            interval: DEFAULT_INTERVAL,
            port: port.to_string(),
            signature: None,
        }
    }

    /// The file state the current table was loaded from. Take it before
    /// reading the file so an edit racing the initial load is not missed.
    pub fn with_baseline(mut self, signature: Option<FileSignature>) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Port named by the most recently loaded file.
    pub fn configured_port(&self) -> &str {
        &self.port
    }

    /// Check the file once, reloading if it changed.
    pub async fn poll(&mut self) -> PollOutcome {
        let current = match FileSignature::read(&self.path).await {
            Ok(signature) => signature,
            Err(e) => {
                if self.signature.take().is_some() {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Config file unavailable. Keeping current configuration."
                    );
                }
                return PollOutcome::Missing;
            }
        };

        if self.signature == Some(current) {
            return PollOutcome::Unchanged;
        }
        // remember the new state even if loading fails, so a broken file is
        // reported once per edit
        self.signature = Some(current);

        info!(path = %self.path.display(), "Config file change detected, reloading");
        match MockerConfig::read(&self.path).await {
            Ok(config) => {
                if config.port() != self.port {
                    warn!(
                        previous = %self.port,
                        configured = %config.port(),
                        "Port change requires a restart; keeping the current listener"
                    );
                    self.port = config.port().to_string();
                }
                log_routes(&config);
                let patterns = config.routes.len();
                let routes = config.route_count();
                self.routes.store(Arc::new(RouteTable::new(config.routes)));
                info!(patterns, routes, "Config reloaded");
                PollOutcome::Reloaded
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload config. Keeping current configuration."
                );
                PollOutcome::Failed
            }
        }
    }

    /// Poll forever at the configured interval.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        info!(
            path = %self.path.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Config watcher started"
        );
        loop {
            ticker.tick().await;
            self.poll().await;
        }
    }

    /// Run the watcher on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;

    const FIRST: &str = "routes:\n  /first:\n    get:\n      - response: one\n";
    const SECOND: &str = "routes:\n  /second:\n    get:\n      - response: two\n  /third:\n    get:\n      - response: three\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        routes: SharedRoutes,
        baseline: Option<FileSignature>,
    }

    impl Fixture {
        async fn new(content: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mocker.yaml");
            std::fs::write(&path, content).unwrap();
            let baseline = FileSignature::read(&path).await.ok();
            let routes = Arc::new(ArcSwap::from_pointee(load(&path).unwrap()));
            Self {
                _dir: dir,
                path,
                routes,
                baseline,
            }
        }

        fn watcher(&self) -> ReloadWatcher {
            ReloadWatcher::new(&self.path, self.routes.clone(), "8080").with_baseline(self.baseline)
        }

        fn write(&self, content: &str) {
            std::fs::write(&self.path, content).unwrap();
        }

        fn patterns(&self) -> Vec<String> {
            self.routes
                .load()
                .entries()
                .iter()
                .map(|e| e.pattern.as_str().to_string())
                .collect()
        }
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(matches!(load(&path), Err(ConfigError::Io { .. })));

        std::fs::write(&path, "routes: [").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_reloaded() {
        let fixture = Fixture::new(FIRST).await;
        let before = fixture.routes.load_full();
        let mut watcher = fixture.watcher();

        assert_eq!(watcher.poll().await, PollOutcome::Unchanged);
        assert!(Arc::ptr_eq(&before, &fixture.routes.load_full()));
    }

    #[tokio::test]
    async fn test_without_baseline_first_poll_reloads() {
        let fixture = Fixture::new(FIRST).await;
        let mut watcher = ReloadWatcher::new(&fixture.path, fixture.routes.clone(), "8080");

        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(watcher.poll().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_edit_after_baseline_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mocker.yaml");
        std::fs::write(&path, FIRST).unwrap();

        // baseline taken, then the file changes before the startup load
        let baseline = FileSignature::read(&path).await.ok();
        std::fs::write(&path, SECOND).unwrap();
        let routes: SharedRoutes = Arc::new(ArcSwap::from_pointee(load(&path).unwrap()));

        let mut watcher = ReloadWatcher::new(&path, routes.clone(), "8080").with_baseline(baseline);
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(routes.load().len(), 2);
    }

    #[tokio::test]
    async fn test_change_swaps_table() {
        let fixture = Fixture::new(FIRST).await;
        let before = fixture.routes.load_full();
        let mut watcher = fixture.watcher();

        fixture.write(SECOND);
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(fixture.patterns(), ["/second", "/third"]);

        // a reader holding the old snapshot still sees the old table
        assert_eq!(before.len(), 1);
        assert!(before.find("/first").is_some());
        assert!(before.find("/second").is_none());
    }

    #[tokio::test]
    async fn test_port_tracks_file_not_listener() {
        let fixture = Fixture::new(FIRST).await;
        let mut watcher = fixture.watcher();
        assert_eq!(watcher.configured_port(), "8080");

        fixture.write("port: 9090\nroutes:\n  /a:\n    get:\n      - response: a\n");
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(watcher.configured_port(), "9090");

        // the same port on the next edit is not a change
        fixture.write("port: 9090\nroutes:\n  /bb:\n    get:\n      - response: bb\n");
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(watcher.configured_port(), "9090");
        assert_eq!(fixture.patterns(), ["/bb"]);
    }

    #[tokio::test]
    async fn test_broken_reload_keeps_last_good_table() {
        let fixture = Fixture::new(FIRST).await;
        let mut watcher = fixture.watcher();

        fixture.write("routes: [not, a, map");
        assert_eq!(watcher.poll().await, PollOutcome::Failed);
        assert_eq!(fixture.patterns(), ["/first"]);

        // reported once, not on every tick
        assert_eq!(watcher.poll().await, PollOutcome::Unchanged);

        fixture.write(SECOND);
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(fixture.patterns(), ["/second", "/third"]);
    }

    #[tokio::test]
    async fn test_missing_file_keeps_table() {
        let fixture = Fixture::new(FIRST).await;
        let mut watcher = fixture.watcher();

        std::fs::remove_file(&fixture.path).unwrap();
        assert_eq!(watcher.poll().await, PollOutcome::Missing);
        assert_eq!(fixture.patterns(), ["/first"]);

        fixture.write(FIRST);
        assert_eq!(watcher.poll().await, PollOutcome::Reloaded);
        assert_eq!(fixture.patterns(), ["/first"]);
    }

    #[tokio::test]
    async fn test_background_task_picks_up_changes() {
        let fixture = Fixture::new(FIRST).await;
        let handle = fixture
            .watcher()
            .with_interval(Duration::from_millis(20))
            .spawn();

        fixture.write(SECOND);

        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if fixture.patterns() == ["/second", "/third"] {
                reloaded = true;
                break;
            }
        }
        handle.abort();
        assert!(reloaded, "watcher did not publish the new table");
    }
}
