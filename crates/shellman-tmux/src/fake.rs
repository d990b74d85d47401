//! In-memory tmux facade for tests.
//!
//! Panes are plain records behind a mutex. Tests mutate them directly
//! (`push_output`, `end_pane`) and the actors under test observe the same
//! behavior they would against a real server, including the
//! "can't find pane" classification once a pane ends.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TmuxError;
use crate::facade::{CursorPos, PaneListing, TmuxFacade};

#[derive(Debug, Clone, Default)]
pub struct FakePane {
    pub pane_id: String,
    pub session: String,
    pub pane_pid: u32,
    pub snapshot: String,
    pub history: String,
    pub cursor: Option<CursorPos>,
    pub title: String,
    pub current_command: String,
    pub last_active_at: Option<DateTime<Utc>>,
    pub options: HashMap<String, String>,
    pub ended: bool,
}

#[derive(Default)]
struct FakeState {
    panes: HashMap<String, FakePane>,
    inputs: Vec<(String, String)>,
    resizes: Vec<(String, u32, u32)>,
    selected: Vec<String>,
    next_pane: u32,
}

/// In-memory [`TmuxFacade`].
#[derive(Default)]
pub struct FakeTmux {
    state: Mutex<FakeState>,
}

impl FakeTmux {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_pane(&self, target: &str, snapshot: &str) {
        let mut st = self.lock();
        let n = st.next_pane;
        st.next_pane += 1;
        let session = target.split(':').next().unwrap_or("").to_owned();
        st.panes.insert(
            target.to_owned(),
            FakePane {
                pane_id: format!("%{n}"),
                session,
                pane_pid: 1000 + n,
                snapshot: snapshot.to_owned(),
                history: snapshot.to_owned(),
                current_command: "bash".to_owned(),
                ..FakePane::default()
            },
        );
    }

    /// Append realtime output to a pane's snapshot and history.
    pub fn push_output(&self, target: &str, text: &str) {
        let mut st = self.lock();
        if let Some(p) = st.panes.get_mut(target) {
            p.snapshot.push_str(text);
            p.history.push_str(text);
        }
    }

    pub fn set_snapshot(&self, target: &str, text: &str) {
        let mut st = self.lock();
        if let Some(p) = st.panes.get_mut(target) {
            p.snapshot = text.to_owned();
        }
    }

    pub fn set_cursor(&self, target: &str, cursor: Option<CursorPos>) {
        let mut st = self.lock();
        if let Some(p) = st.panes.get_mut(target) {
            p.cursor = cursor;
        }
    }

    pub fn set_title_and_command(&self, target: &str, title: &str, command: &str) {
        let mut st = self.lock();
        if let Some(p) = st.panes.get_mut(target) {
            p.title = title.to_owned();
            p.current_command = command.to_owned();
        }
    }

    /// Mark a pane gone; subsequent operations fail like tmux would.
    pub fn end_pane(&self, target: &str) {
        let mut st = self.lock();
        if let Some(p) = st.panes.get_mut(target) {
            p.ended = true;
        }
    }

    pub fn sent_inputs(&self) -> Vec<(String, String)> {
        self.lock().inputs.clone()
    }

    pub fn resizes(&self) -> Vec<(String, u32, u32)> {
        self.lock().resizes.clone()
    }

    pub fn selected(&self) -> Vec<String> {
        self.lock().selected.clone()
    }

    fn check<'a>(
        st: &'a mut FakeState,
        target: &str,
    ) -> Result<&'a mut FakePane, TmuxError> {
        match st.panes.get_mut(target) {
            Some(p) if !p.ended => Ok(p),
            _ => Err(TmuxError::PaneMissing(format!("can't find pane: {target}"))),
        }
    }
}

#[async_trait]
impl TmuxFacade for FakeTmux {
    async fn list_sessions(&self) -> Result<Vec<PaneListing>, TmuxError> {
        let st = self.lock();
        let mut listings: Vec<PaneListing> = st
            .panes
            .iter()
            .filter(|(_, p)| !p.ended)
            .map(|(target, p)| PaneListing {
                target: target.clone(),
                pane_id: p.pane_id.clone(),
                session: p.session.clone(),
                pane_pid: p.pane_pid,
            })
            .collect();
        listings.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(listings)
    }

    async fn pane_exists(&self, target: &str) -> Result<bool, TmuxError> {
        let st = self.lock();
        Ok(st.panes.get(target).is_some_and(|p| !p.ended))
    }

    async fn select_pane(&self, target: &str) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?;
        st.selected.push(target.to_owned());
        Ok(())
    }

    async fn send_input(&self, target: &str, text: &str) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?;
        st.inputs.push((target.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn resize(&self, target: &str, cols: u32, rows: u32) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?;
        st.resizes.push((target.to_owned(), cols, rows));
        Ok(())
    }

    async fn capture_pane(&self, target: &str) -> Result<String, TmuxError> {
        let mut st = self.lock();
        Ok(FakeTmux::check(&mut st, target)?.snapshot.clone())
    }

    async fn capture_history(&self, target: &str, _lines: u32) -> Result<String, TmuxError> {
        let mut st = self.lock();
        Ok(FakeTmux::check(&mut st, target)?.history.clone())
    }

    async fn start_pipe_pane(&self, target: &str, _command: &str) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?;
        Ok(())
    }

    async fn stop_pipe_pane(&self, target: &str) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?;
        Ok(())
    }

    async fn cursor_position(&self, target: &str) -> Result<Option<CursorPos>, TmuxError> {
        let mut st = self.lock();
        Ok(FakeTmux::check(&mut st, target)?.cursor)
    }

    async fn create_sibling_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.create_sibling_pane_in_dir(target, "").await
    }

    async fn create_sibling_pane_in_dir(
        &self,
        target: &str,
        _dir: &str,
    ) -> Result<String, TmuxError> {
        {
            let mut st = self.lock();
            FakeTmux::check(&mut st, target)?;
        }
        let new_target = format!("{target}-sibling");
        self.add_pane(&new_target, "");
        Ok(new_target)
    }

    async fn create_child_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.create_child_pane_in_dir(target, "").await
    }

    async fn create_child_pane_in_dir(
        &self,
        target: &str,
        _dir: &str,
    ) -> Result<String, TmuxError> {
        {
            let mut st = self.lock();
            FakeTmux::check(&mut st, target)?;
        }
        let new_target = format!("{target}-child");
        self.add_pane(&new_target, "");
        Ok(new_target)
    }

    async fn create_root_pane(&self, session: &str) -> Result<String, TmuxError> {
        self.create_root_pane_in_dir(session, "").await
    }

    async fn create_root_pane_in_dir(
        &self,
        session: &str,
        _dir: &str,
    ) -> Result<String, TmuxError> {
        let n = self.lock().next_pane;
        let new_target = format!("{session}:{n}.0");
        self.add_pane(&new_target, "");
        Ok(new_target)
    }

    async fn pane_last_active_at(
        &self,
        target: &str,
    ) -> Result<Option<DateTime<Utc>>, TmuxError> {
        let mut st = self.lock();
        Ok(FakeTmux::check(&mut st, target)?.last_active_at)
    }

    async fn pane_title_and_current_command(
        &self,
        target: &str,
    ) -> Result<(String, String), TmuxError> {
        let mut st = self.lock();
        let p = FakeTmux::check(&mut st, target)?;
        Ok((p.title.clone(), p.current_command.clone()))
    }

    async fn get_pane_option(
        &self,
        target: &str,
        name: &str,
    ) -> Result<Option<String>, TmuxError> {
        let mut st = self.lock();
        Ok(FakeTmux::check(&mut st, target)?.options.get(name).cloned())
    }

    async fn set_pane_option(
        &self,
        target: &str,
        name: &str,
        value: &str,
    ) -> Result<(), TmuxError> {
        let mut st = self.lock();
        FakeTmux::check(&mut st, target)?
            .options
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    async fn server_instance_id(&self) -> Result<String, TmuxError> {
        Ok("fake:0".to_owned())
    }
}
