//! Filesystem event source for the reindex trigger.

use super::reindex::ChangeListener;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub trait FileWatcher {
    /// Stop delivering events. Idempotent.
    fn close(&mut self);
}

/// Recursive `notify` watcher. Events are forwarded from notify's thread over
/// a channel and delivered to the listener on a tokio task.
pub struct NotifyWatcher {
    watcher: Option<RecommendedWatcher>,
    forwarder: Option<JoinHandle<()>>,
}

impl NotifyWatcher {
    /// Must be called from inside a tokio runtime.
    pub fn start(root: &Path, listener: Arc<dyn ChangeListener>) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !is_content_change(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Err(err) => warn!("watcher error: {err:?}"),
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!("Watching {}", root.display());

        let forwarder = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                listener.on_change(&path);
            }
        });

        Ok(Self {
            watcher: Some(watcher),
            forwarder: Some(forwarder),
        })
    }
}

impl FileWatcher for NotifyWatcher {
    fn close(&mut self) {
        // Dropping the watcher closes the channel sender
        self.watcher.take();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
