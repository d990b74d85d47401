//! Startup hydration of pane runtime baselines.
//!
//! Persisted pane runtime rows seed the status state machines so a
//! daemon restart neither resets activity timestamps nor re-fires
//! auto-completion for panes that were already ready.

use std::collections::HashMap;
use std::sync::Mutex;

use shellman_core::report::PaneRuntimeBaseline;
use shellman_store::Store;

/// Baselines keyed by pane target.
pub fn load_baselines(store: &Mutex<Store>) -> HashMap<String, PaneRuntimeBaseline> {
    let store = store.lock().unwrap_or_else(|e| e.into_inner());
    let rows = match store.list_pane_runtime() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "baseline load failed; starting cold");
            return HashMap::new();
        }
    };

    let mut baselines = HashMap::with_capacity(rows.len());
    for row in rows {
        if row.pane_target.is_empty() {
            continue;
        }
        baselines.insert(
            row.pane_target.clone(),
            PaneRuntimeBaseline {
                last_active_at: Some(row.updated_at),
                runtime_status: row.runtime_status,
                snapshot_hash: row.snapshot_hash,
            },
        );
    }
    tracing::info!(count = baselines.len(), "loaded pane runtime baselines");
    baselines
}
