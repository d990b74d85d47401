//! Ready-edge auto progression.
//!
//! When an armed pane flips running→ready, the pane actor calls into
//! here exactly once per edge. The runner resolves the task bound to the
//! pane, records the event on the task's conversation, and, when an LLM
//! endpoint is configured, kicks off one action-loop turn so the model
//! can inspect the pane and decide the next step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shellman_llm::action::{ActionLoop, Allowlist};
use shellman_llm::tool::ToolScope;
use shellman_store::Store;

use crate::pane::AutoCompleteExecutor;

pub struct ReadyAutoRunner {
    store: Arc<Mutex<Store>>,
    action: Option<Arc<ActionLoop>>,
    allowlist: Option<Allowlist>,
}

impl ReadyAutoRunner {
    pub fn new(
        store: Arc<Mutex<Store>>,
        action: Option<Arc<ActionLoop>>,
        allowlist: Option<Allowlist>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            action,
            allowlist,
        })
    }

    fn find_bound_task(&self, target: &str) -> Option<(String, String)> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let bindings = match store.load_panes() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "auto run: load_panes failed");
                HashMap::new()
            }
        };
        let task_id = bindings
            .iter()
            .find(|(_, b)| b.pane_target == target)
            .map(|(task_id, _)| task_id.clone())?;
        let project_id = store
            .get_task(&task_id)
            .ok()
            .flatten()
            .map(|t| t.project_id)
            .unwrap_or_default();
        Some((task_id, project_id))
    }
}

#[async_trait]
impl AutoCompleteExecutor for ReadyAutoRunner {
    async fn on_ready_edge(
        &self,
        target: &str,
        observed_last_active_at: Option<DateTime<Utc>>,
    ) {
        let Some((task_id, project_id)) = self.find_bound_task(target) else {
            tracing::debug!(target, "auto run: ready edge on unbound pane");
            return;
        };
        tracing::info!(target, task_id = %task_id, "auto run: pane ready");

        {
            let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            let note = match observed_last_active_at {
                Some(at) => format!("pane became ready (last activity {})", at.to_rfc3339()),
                None => "pane became ready".to_owned(),
            };
            if let Err(e) = store.insert_task_message(&task_id, "system", &note, Utc::now()) {
                tracing::warn!(task_id = %task_id, error = %e, "auto run: note failed");
            }
        }

        let Some(action) = &self.action else { return };
        let scope = ToolScope {
            project_id: Some(project_id),
            task_id: Some(task_id.clone()),
            pane_target: Some(target.to_owned()),
        };
        let prompt = format!(
            "The pane for task {task_id} just became ready. Inspect its output and \
             either continue the task or flag it."
        );
        match action.run(&scope, &prompt, self.allowlist.as_ref(), None).await {
            Ok(text) => {
                tracing::info!(task_id = %task_id, "auto run: action loop finished");
                let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = store.insert_task_message(&task_id, "assistant", &text, Utc::now()) {
                    tracing::warn!(task_id = %task_id, error = %e, "auto run: save reply failed");
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "auto run: action loop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellman_store::{PaneBinding, TaskRow};

    fn store_with_binding() -> Arc<Mutex<Store>> {
        let store = Store::open_in_memory().unwrap();
        store.insert_project("p1", "demo").unwrap();
        store
            .insert_task(&TaskRow {
                task_id: "t1".into(),
                project_id: "p1".into(),
                parent_id: None,
                title: "work".into(),
                description: String::new(),
                status: "open".into(),
                flag: None,
                status_message: None,
                last_modified: 1,
            })
            .unwrap();
        store
            .bind_pane(
                "t1",
                &PaneBinding {
                    pane_id: "%1".into(),
                    pane_target: "e2e:0.0".into(),
                    pane_uuid: String::new(),
                },
            )
            .unwrap();
        Arc::new(Mutex::new(store))
    }

    #[tokio::test]
    async fn ready_edge_records_a_task_note() {
        let store = store_with_binding();
        let runner = ReadyAutoRunner::new(Arc::clone(&store), None, None);

        runner.on_ready_edge("e2e:0.0", Some(Utc::now())).await;

        let messages = store.lock().unwrap().list_task_messages("t1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].source, "system");
        assert!(messages[0].body.contains("ready"));
    }

    #[tokio::test]
    async fn unbound_pane_is_a_no_op() {
        let store = store_with_binding();
        let runner = ReadyAutoRunner::new(Arc::clone(&store), None, None);

        runner.on_ready_edge("other:9.9", None).await;

        let messages = store.lock().unwrap().list_task_messages("t1").unwrap();
        assert!(messages.is_empty());
    }
}
