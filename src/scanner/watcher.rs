use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use super::ScanScheduler;
use crate::debounce::EventSuppressor;
use crate::paths;

/// Watches the library root and turns raw filesystem events into
/// debounced scan requests. Events inside the suppression window (the
/// app's own writes) and events on non-card paths are dropped before they
/// can queue anything.
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
}

impl LibraryWatcher {
    pub fn start(
        root: &Path,
        suppressor: Arc<EventSuppressor>,
        scheduler: ScanScheduler,
    ) -> Result<Self, String> {
        let (tx, rx) = mpsc::channel();

        let mut watcher =
            RecommendedWatcher::new(tx, Config::default()).map_err(|e| e.to_string())?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| e.to_string())?;

        thread::spawn(move || {
            for result in rx {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("[Watcher] file watcher error: {}", e);
                        continue;
                    }
                };

                // Reads generate no reconciliation work.
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }

                for path in &event.paths {
                    let name = match path.file_name().and_then(|n| n.to_str()) {
                        Some(name) => name,
                        None => continue,
                    };
                    if !paths::is_card_file(name) {
                        continue;
                    }

                    // Our own writes are already reflected in the store
                    // and cache; ignore the echo.
                    if suppressor.is_suppressed() {
                        log::debug!("[Watcher] suppressed event for {}", name);
                        continue;
                    }

                    scheduler.request(&format!("{}:{}", kind_label(&event.kind), name));
                }
            }
            log::info!("[Watcher] event loop stopped");
        });

        log::info!("[Watcher] watching {:?}", root);
        Ok(Self { _watcher: watcher })
    }
}

fn kind_label(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Create(_) => "created",
        EventKind::Modify(_) => "modified",
        EventKind::Remove(_) => "deleted",
        _ => "changed",
    }
}
