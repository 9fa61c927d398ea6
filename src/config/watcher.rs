use crate::config::Config;
use anyhow::{Context, Result};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Minimum spacing between two reloads of the same file
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Grace period for the writer to finish before the file is read
const SETTLE: Duration = Duration::from_millis(50);

/// Watches the config file and yields every valid new version of it.
///
/// The parent directory is watched rather than the file itself so editors
/// that save by renaming a temporary file are picked up too. Dropping the
/// watcher stops notifications.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn start(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<Config>)> {
        let path = path.to_path_buf();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .with_context(|| format!("Config path has no file name: {:?}", path))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let last_reload: Mutex<Option<Instant>> = Mutex::new(None);
        let config_path = path.clone();

        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    error!("Config watch error: {:?}", e);
                    return;
                }
            };

            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                return;
            }

            {
                let mut last = last_reload.lock();
                if last.is_some_and(|at| at.elapsed() < DEBOUNCE) {
                    return;
                }
                *last = Some(Instant::now());
            }

            debug!("Config file changed: {:?}", event.kind);
            std::thread::sleep(SETTLE);

            match Config::load(&config_path) {
                Ok(config) => {
                    info!("Config reloaded from {:?}", config_path);
                    if tx.send(config).is_err() {
                        debug!("No config subscriber left");
                    }
                }
                Err(e) => warn!("Ignoring invalid config change: {:#}", e),
            }
        })?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", directory))?;

        info!("Watching config file for changes: {:?}", path);

        Ok((
            Self {
                path,
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Forward config reloads to `on_reload` until the watcher fails or is dropped
pub fn watch_config_async<F>(path: PathBuf, mut on_reload: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Config) + Send + 'static,
{
    tokio::spawn(async move {
        let (watcher, mut rx) = match ConfigWatcher::start(&path) {
            Ok(started) => started,
            Err(e) => {
                error!("Config watcher error: {:#}", e);
                return;
            }
        };

        while let Some(config) = rx.recv().await {
            on_reload(config);
        }

        debug!("Config watcher for {:?} stopped", watcher.path());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_path_without_file_name() {
        assert!(ConfigWatcher::start(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_reload_on_change() {
        let dir = std::env::temp_dir().join(format!("voicerelay-watch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("voicerelay.yaml");
        std::fs::write(&path, "relay:\n  address: \"127.0.0.1:24454\"\n").unwrap();

        let (_watcher, mut rx) = ConfigWatcher::start(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(
            &path,
            "sessions:\n  \"00000000-0000-0000-0000-000000000001\": \"10.0.0.5:5000\"\n",
        )
        .unwrap();

        let config = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config.sessions.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
