//! Config hot reload.
//!
//! File events feed a [`Debouncer`]; when a burst of events goes quiet for
//! the debounce window the config is loaded again and the registry is
//! reconciled against the new backend list. A config that fails to load or
//! validate is logged and ignored, leaving the running backends untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sb_domain::ConfigSource;

use crate::bootstrap::log_config_warnings;
use crate::registry::Registry;

/// A single cancellable delayed task.
///
/// Every [`trigger`](Self::trigger) aborts the pending task and schedules a
/// fresh one, so at most one fire is ever outstanding. When the delay
/// elapses the task sends its generation number on the fire channel; the
/// owner checks it with [`take_fire`](Self::take_fire), which rejects fires
/// that were already in the channel when a newer trigger arrived.
pub struct Debouncer {
    delay: Duration,
    fire_tx: mpsc::Sender<u64>,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration, fire_tx: mpsc::Sender<u64>) -> Self {
        Self {
            delay,
            fire_tx,
            generation: 0,
            pending: None,
        }
    }

    /// (Re)start the delay. Returns the generation of the scheduled fire.
    pub fn trigger(&mut self) -> u64 {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let delay = self.delay;
        let tx = self.fire_tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(generation).await;
        }));
        generation
    }

    /// Drop the pending fire, if any.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Accept a fire received from the channel. `false` means it is stale.
    pub fn take_fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        true
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The action run once a burst of change events has settled.
#[async_trait]
pub trait Reload: Send + Sync {
    async fn reload(&self);
}

/// Reloads the backend list from a [`ConfigSource`] and reconciles.
pub struct ConfigReloader {
    source: Arc<dyn ConfigSource>,
    registry: Arc<Registry>,
}

impl ConfigReloader {
    pub fn new(source: Arc<dyn ConfigSource>, registry: Arc<Registry>) -> Self {
        Self { source, registry }
    }
}

#[async_trait]
impl Reload for ConfigReloader {
    async fn reload(&self) {
        let config = match self.source.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed, keeping current backends");
                return;
            }
        };
        log_config_warnings(&config);

        tracing::info!(backends = config.backends.len(), "config changed, reconciling");
        let report = self.registry.reconcile(config.backends).await;
        for (name, error) in &report.failed {
            tracing::warn!(backend = %name, %error, "backend unavailable after reload");
        }
    }
}

/// Debounce `events` into reloads until `shutdown` fires or the event
/// stream ends. A pending reload is dropped on exit.
pub async fn run_reload_loop(
    mut events: mpsc::Receiver<()>,
    delay: Duration,
    reload: Arc<dyn Reload>,
    shutdown: CancellationToken,
) {
    let (fire_tx, mut fire_rx) = mpsc::channel(4);
    let mut debouncer = Debouncer::new(delay, fire_tx);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                if debouncer.is_pending() {
                    tracing::debug!("shutdown with a reload pending, dropping it");
                }
                break;
            }
            event = events.recv() => {
                if event.is_none() {
                    tracing::debug!("config event stream closed");
                    break;
                }
                let generation = debouncer.trigger();
                tracing::trace!(generation, "config change, reload scheduled");
            }
            Some(generation) = fire_rx.recv() => {
                if !debouncer.take_fire(generation) {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = reload.reload() => {}
                }
            }
        }
    }
}

/// A running file watcher plus its reload loop.
pub struct ConfigWatcher {
    // Kept alive for as long as events should flow.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `path` and reload through `reload` after each settled burst of
    /// changes.
    ///
    /// The parent directory is watched rather than the file itself, since
    /// editors commonly save by writing a new file and renaming it over the
    /// old one.
    pub fn spawn(
        path: &Path,
        delay: Duration,
        reload: Arc<dyn Reload>,
        shutdown: CancellationToken,
    ) -> notify::Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| notify::Error::generic("config path has no file name"))?;
        let dir = watch_dir(path);

        let (events_tx, events_rx) = mpsc::channel(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                    // A full channel already has a reload coming.
                    let _ = events_tx.try_send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "config watch error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(
            path = %path.display(),
            debounce_ms = delay.as_millis() as u64,
            "watching config for changes"
        );

        let task = tokio::spawn(run_reload_loop(events_rx, delay, reload, shutdown));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Wait for the reload loop to finish (after shutdown is signalled).
    pub async fn join(self) {
        let Self { _watcher, task } = self;
        drop(_watcher);
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "config watcher task failed");
            }
        }
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sb_domain::TomlFileSource;

    use super::*;
    use crate::catalog::Catalog;
    use crate::testing::FakeConnector;

    const DELAY: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct CountingReload(AtomicUsize);

    impl CountingReload {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reload for CountingReload {
        async fn reload(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start_loop() -> (mpsc::Sender<()>, Arc<CountingReload>, CancellationToken, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let reload = Arc::new(CountingReload::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_reload_loop(rx, DELAY, reload.clone(), shutdown.clone()));
        (tx, reload, shutdown, task)
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_fires_once_with_latest_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut debouncer = Debouncer::new(DELAY, tx);

        for _ in 0..5 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(rx.try_recv().is_err());

        let generation = rx.recv().await.unwrap();
        assert_eq!(generation, 5);
        assert!(debouncer.take_fire(generation));
        assert!(!debouncer.is_pending());

        tokio::time::sleep(DELAY * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_is_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let mut debouncer = Debouncer::new(DELAY, tx);
        let first = debouncer.trigger();
        let second = debouncer.trigger();
        assert!(!debouncer.take_fire(first));
        assert!(debouncer.take_fire(second));
        assert!(!debouncer.take_fire(second));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_reloads_once() {
        let (tx, reload, shutdown, task) = start_loop();

        for _ in 0..10 {
            tx.send(()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(reload.count(), 0);

        tokio::time::sleep(DELAY + Duration::from_millis(10)).await;
        assert_eq!(reload.count(), 1);

        // A later, separate change reloads again.
        tx.send(()).await.unwrap();
        tokio::time::sleep(DELAY + Duration::from_millis(10)).await;
        assert_eq!(reload.count(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reload() {
        let (tx, reload, shutdown, task) = start_loop();

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        task.await.unwrap();

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(reload.count(), 0);
    }

    fn write_config(file: &mut tempfile::NamedTempFile, body: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        std::io::Seek::rewind(f).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    const ALPHA: &str = r#"
[[backends]]
name = "alpha"
transport = "http"
url = "http://alpha.test/mcp"
"#;

    const ALPHA_BETA: &str = r#"
[[backends]]
name = "alpha"
transport = "http"
url = "http://alpha.test/mcp"

[[backends]]
name = "beta"
transport = "http"
url = "http://beta.test/mcp"
"#;

    #[tokio::test]
    async fn reloader_reconciles_and_survives_bad_config() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_backend("alpha", &["search"])
                .with_backend("beta", &["fetch"]),
        );
        let registry = Arc::new(Registry::new(connector, Arc::new(Catalog::new())));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let reloader = ConfigReloader::new(Arc::new(TomlFileSource::new(file.path())), registry.clone());

        write_config(&mut file, ALPHA_BETA);
        reloader.reload().await;
        assert_eq!(registry.names(), vec!["alpha", "beta"]);

        // Broken TOML: nothing changes.
        write_config(&mut file, "[[backends]\nname = ");
        reloader.reload().await;
        assert_eq!(registry.names(), vec!["alpha", "beta"]);

        // Valid TOML that fails validation: nothing changes either.
        write_config(&mut file, "[[backends]]\nname = \"gamma\"\ntransport = \"stdio\"\n");
        reloader.reload().await;
        assert_eq!(registry.names(), vec!["alpha", "beta"]);

        write_config(&mut file, ALPHA);
        reloader.reload().await;
        assert_eq!(registry.names(), vec!["alpha"]);
        assert!(registry.catalog().get("beta-fetch").is_none());
    }

    #[tokio::test]
    async fn file_changes_trigger_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, ALPHA).unwrap();

        let reload = Arc::new(CountingReload::default());
        let shutdown = CancellationToken::new();
        let watcher = ConfigWatcher::spawn(&path, Duration::from_millis(50), reload.clone(), shutdown.clone()).unwrap();

        // Unrelated files in the same directory are ignored.
        std::fs::write(dir.path().join("other.toml"), "x = 1").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reload.count(), 0);

        std::fs::write(&path, ALPHA_BETA).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reload.count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reload.count() >= 1);

        shutdown.cancel();
        watcher.join().await;
    }

    #[test]
    fn bare_file_name_watches_current_dir() {
        assert_eq!(watch_dir(Path::new("config.toml")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/etc/sb/config.toml")), PathBuf::from("/etc/sb"));
    }
}
