//! Watches the plan snapshot directory for external deletion of a
//! `plan-<planId>.json` file (spec.md §4.7: "A file watcher listens for
//! external deletion of any plan snapshot: on delete, remove the plan from
//! memory and emit `planDeleted`").

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};

use crate::domain::PlanId;

/// Events from the plan-store watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A plan's snapshot file disappeared from disk.
    PlanDeleted(PlanId),
    Error(String),
}

/// Watches `store_dir` for `plan-*.json` removals.
pub struct PlanStoreWatcher {
    rx: mpsc::Receiver<WatchEvent>,
    _watcher: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl PlanStoreWatcher {
    pub fn new(store_dir: &Path, debounce_ms: u64) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let tx_clone = tx.clone();
        let mut debouncer = new_debouncer(
            Duration::from_millis(debounce_ms),
            move |res: DebounceEventResult| match res {
                Ok(events) => {
                    for event in events {
                        if !matches!(event.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous) {
                            continue;
                        }
                        if let Some(plan_id) = plan_id_from_path(&event.path) {
                            if !event.path.exists() {
                                let _ = tx_clone.send(WatchEvent::PlanDeleted(plan_id));
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx_clone.send(WatchEvent::Error(e.to_string()));
                }
            },
        )?;

        std::fs::create_dir_all(store_dir)?;
        debouncer.watcher().watch(store_dir, notify::RecursiveMode::NonRecursive)?;

        Ok(Self {
            rx,
            _watcher: debouncer,
        })
    }

    /// Try to receive a watch event (non-blocking).
    pub fn try_recv(&self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Parses `plan-<uuid>.json` out of a path's file name, ignoring
/// `.lock`/`.tmp` sidecar files and anything that doesn't match.
fn plan_id_from_path(path: &PathBuf) -> Option<PlanId> {
    let file_name = path.file_name()?.to_str()?;
    let id = file_name.strip_prefix("plan-")?.strip_suffix(".json")?;
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_id_from_snapshot_filename() {
        let id = PlanId::new_v4();
        let path = PathBuf::from(format!("/tmp/plan-{}.json", id));
        assert_eq!(plan_id_from_path(&path), Some(id));
    }

    #[test]
    fn ignores_lock_and_tmp_sidecars() {
        let id = PlanId::new_v4();
        assert_eq!(
            plan_id_from_path(&PathBuf::from(format!("/tmp/plan-{}.json.lock", id))),
            None
        );
        assert_eq!(
            plan_id_from_path(&PathBuf::from(format!("/tmp/plan-{}.json.tmp", id))),
            None
        );
    }
}
