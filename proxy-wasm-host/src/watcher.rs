//! Module file watcher
//!
//! A config update only rebuilds a plugin when its engine, path or url
//! changes. This watcher covers the remaining case: the module file is
//! rewritten in place. It watches the parent directory of every watched
//! plugin's file, debounces events, and reloads the affected plugins.
//!
//! Each watched plugin gets a [`PluginHandler`] on its wrapper, so a config
//! update that moves the module re-points the watch at the new file, and
//! one that switches to a url source drops it.

use crate::error::WasmError;
use crate::manager::WasmManager;
use crate::wrapper::{PluginHandler, PluginWrapper};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use proxy_wasm_api::{PluginConfig, WasmSource};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the source watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Watched plugins and the notify handle watching their directories
struct Watches {
    watcher: RecommendedWatcher,
    /// Plugin name -> canonical module path
    plugins: HashMap<String, PathBuf>,
    dirs: HashSet<PathBuf>,
}

impl Watches {
    /// Map `plugin_name` to `path`, watching its directory if needed
    fn point(&mut self, plugin_name: &str, path: PathBuf) -> Result<(), WatcherError> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatcherError::Io(format!("No parent directory: {}", path.display())))?;

        if !self.dirs.contains(&dir) {
            self.watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(WatcherError::WatcherInit)?;
            tracing::info!(dir = %dir.display(), "Watching directory for module changes");
            self.dirs.insert(dir);
        }

        tracing::debug!(plugin = %plugin_name, path = %path.display(), "Watching module file");
        self.plugins.insert(plugin_name.to_string(), path);
        self.prune_dirs();
        Ok(())
    }

    fn remove(&mut self, plugin_name: &str) {
        if self.plugins.remove(plugin_name).is_some() {
            tracing::debug!(plugin = %plugin_name, "Stopped watching module file");
            self.prune_dirs();
        }
    }

    /// Stop watching directories no plugin file lives in anymore
    fn prune_dirs(&mut self) {
        let used: HashSet<&Path> = self.plugins.values().filter_map(|p| p.parent()).collect();
        let unused: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| !used.contains(&dir.as_path()))
            .cloned()
            .collect();

        for dir in unused {
            if let Err(e) = self.watcher.unwatch(&dir) {
                tracing::debug!(dir = %dir.display(), error = %e, "Failed to unwatch directory");
            }
            self.dirs.remove(&dir);
        }
    }

    fn affected_plugins(&self, paths: &[PathBuf]) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|(_, path)| paths.contains(path))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn lock_watches(watches: &Mutex<Watches>) -> MutexGuard<'_, Watches> {
    watches.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canonical module path of a path-sourced config
fn module_path(config: &PluginConfig) -> Result<PathBuf, WatcherError> {
    let path = match config.vm_config.as_ref().and_then(|vm| vm.source()) {
        Some(WasmSource::Path(path)) => PathBuf::from(path),
        _ => return Err(WatcherError::NotPathSourced(config.plugin_name.clone())),
    };
    path.canonicalize()
        .map_err(|e| WatcherError::Io(format!("Failed to resolve {}: {}", path.display(), e)))
}

/// Keeps one plugin's watch in line with its config
struct WatchHandler {
    plugin_name: String,
    watches: Weak<Mutex<Watches>>,
}

impl PluginHandler for WatchHandler {
    fn on_config_update(&self, config: &PluginConfig) {
        let Some(watches) = self.watches.upgrade() else {
            return;
        };
        let mut watches = lock_watches(&watches);
        // Unwatched since the handler was registered
        if !watches.plugins.contains_key(&self.plugin_name) {
            return;
        }

        let result = module_path(config).and_then(|path| {
            if watches.plugins.get(&self.plugin_name) == Some(&path) {
                return Ok(());
            }
            watches.point(&self.plugin_name, path)
        });
        if let Err(e) = result {
            tracing::warn!(plugin = %self.plugin_name, error = %e, "Dropping module watch");
            watches.remove(&self.plugin_name);
        }
    }
}

/// Reloads plugins whose module file changes on disk
pub struct SourceWatcher {
    manager: Arc<WasmManager>,
    watches: Arc<Mutex<Watches>>,
    /// Wrappers that already carry a [`WatchHandler`], by plugin name
    handled: Mutex<HashMap<String, Weak<PluginWrapper>>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SourceWatcher {
    /// Start the watcher task; must be called inside a tokio runtime
    pub fn new(manager: Arc<WasmManager>, config: WatcherConfig) -> Result<Self, WatcherError> {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => tracing::warn!(error = %e, "File watch error"),
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        let watches = Arc::new(Mutex::new(Watches {
            watcher,
            plugins: HashMap::new(),
            dirs: HashSet::new(),
        }));
        let task_watches = Arc::clone(&watches);
        let task_manager = Arc::clone(&manager);
        let debounce = config.debounce;

        tokio::spawn(async move {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut debounce_timer: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Source watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if !(event.kind.is_create() || event.kind.is_modify()) {
                            continue;
                        }
                        for path in event.paths {
                            if !pending.contains(&path) {
                                pending.push(path);
                            }
                        }
                        debounce_timer = Some(tokio::time::Instant::now() + debounce);
                    }

                    _ = async {
                        match debounce_timer {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce_timer = None;
                        let names = lock_watches(&task_watches).affected_plugins(&pending);
                        pending.clear();
                        for name in names {
                            Self::reload(&task_manager, &task_watches, name).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            manager,
            watches,
            handled: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    async fn reload(manager: &Arc<WasmManager>, watches: &Arc<Mutex<Watches>>, name: String) {
        let manager = Arc::clone(manager);
        let task_name = name.clone();
        let result =
            tokio::task::spawn_blocking(move || manager.reload_wasm(&task_name)).await;

        match result {
            Ok(Ok(())) => tracing::info!(plugin = %name, "Plugin reloaded after file change"),
            Ok(Err(WasmError::PluginNotFound(_))) => {
                tracing::info!(plugin = %name, "Plugin was uninstalled, dropping module watch");
                lock_watches(watches).remove(&name);
            }
            Ok(Err(e)) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to reload plugin, keeping previous")
            }
            Err(e) => tracing::error!(plugin = %name, error = %e, "Reload task failed"),
        }
    }

    /// Start watching the module file of a registered plugin
    ///
    /// The watch follows later config updates of the plugin. Returns the
    /// canonical path being watched.
    pub fn watch(&self, plugin_name: &str) -> Result<PathBuf, WatcherError> {
        let wrapper = self
            .manager
            .get_wasm_plugin_wrapper_by_name(plugin_name)
            .ok_or_else(|| WasmError::PluginNotFound(plugin_name.to_string()))?;

        let path = module_path(&wrapper.config())?;
        lock_watches(&self.watches).point(plugin_name, path.clone())?;

        // A re-added plugin has a new wrapper without our handler
        let newly_handled = {
            let mut handled = self.handled.lock().unwrap_or_else(PoisonError::into_inner);
            let current = Arc::downgrade(&wrapper);
            match handled.insert(plugin_name.to_string(), current.clone()) {
                Some(previous) => !Weak::ptr_eq(&previous, &current),
                None => true,
            }
        };
        // Registering replays the current config, which is already in place
        if newly_handled {
            wrapper.register_plugin_handler(Arc::new(WatchHandler {
                plugin_name: plugin_name.to_string(),
                watches: Arc::downgrade(&self.watches),
            }));
        }

        Ok(path)
    }

    /// Stop reloading a plugin on file changes
    pub fn unwatch(&self, plugin_name: &str) {
        lock_watches(&self.watches).remove(plugin_name);
    }

    /// Path currently watched for a plugin
    pub fn watched_path(&self, plugin_name: &str) -> Option<PathBuf> {
        lock_watches(&self.watches).plugins.get(plugin_name).cloned()
    }

    /// Names of plugins currently watched
    pub fn watched_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_watches(&self.watches).plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn manager(&self) -> &Arc<WasmManager> {
        &self.manager
    }

    /// Shutdown the watcher
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Plugin {0} is not loaded from a local path")]
    NotPathSourced(String),

    #[error("Manager error: {0}")]
    Manager(#[from] WasmError),
}
