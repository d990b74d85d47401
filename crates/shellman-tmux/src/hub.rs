//! Shared control-mode subscriptions.
//!
//! One `tmux -C attach-session` child is kept per session that has at
//! least one subscribed pane. The reader task parses `%output` events,
//! maps tmux pane ids to `session:window.pane` targets, and fans decoded
//! bytes out to subscribers. The map is refreshed on subscribe and
//! whenever the child reports an unknown pane id.
//!
//! Per subscriber, a UTF-8 continuation buffer holds the trailing bytes of
//! an incomplete rune so a multi-byte character arriving across two
//! `%output` lines is delivered in one piece. A byte that can never become
//! valid UTF-8 is forwarded verbatim rather than stalling the stream.
//!
//! When a session's last subscriber leaves, the child is told
//! `detach-client`, its stdin is closed, and it is killed if it lingers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::{is_unknown_pane_line, parse_line, ControlEvent};
use crate::error::TmuxError;
use crate::executor::TmuxExecutor;

const PANE_MAP_FORMAT: &str = "#{pane_id}\t#{session_name}:#{window_index}.#{pane_index}";

// ---------------------------------------------------------------------------
// UTF-8 continuation buffering
// ---------------------------------------------------------------------------

/// Accumulates bytes and releases them only at rune boundaries.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns what can be delivered now. Incomplete trailing
    /// sequences stay buffered, invalid bytes pass through verbatim.
    pub fn push(&mut self, data: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(data);
        let emit = complete_prefix_len(&self.pending);
        if emit == 0 {
            return None;
        }
        let rest = self.pending.split_off(emit);
        let out = std::mem::replace(&mut self.pending, rest);
        Some(Bytes::from(out))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence
/// still waiting for continuation bytes.
fn complete_prefix_len(buf: &[u8]) -> usize {
    let n = buf.len();
    let mut i = n;
    let mut back = 0;
    while back < 3 && i > 0 && (buf[i - 1] & 0b1100_0000) == 0b1000_0000 {
        i -= 1;
        back += 1;
    }
    if i == 0 {
        // Orphan continuation bytes: never completable, flush verbatim.
        return n;
    }
    let lead = buf[i - 1];
    let need = if lead >= 0xf0 {
        4
    } else if lead >= 0xe0 {
        3
    } else if lead >= 0xc0 {
        2
    } else {
        // ASCII or stray continuation byte before the tail; nothing pending.
        return n;
    };
    let have = n - (i - 1);
    if have < need {
        i - 1
    } else {
        n
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    assembler: Utf8Assembler,
}

struct SessionShared {
    session: String,
    /// target -> subscribers
    subs: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// pane_id -> target
    pane_map: Mutex<HashMap<String, String>>,
}

impl SessionShared {
    fn lock_subs(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pane_map.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, pane_id: &str) -> Option<String> {
        self.lock_map().get(pane_id).cloned()
    }

    /// Route decoded pane bytes to every subscriber of the target.
    fn deliver(&self, target: &str, data: &[u8]) {
        let mut subs = self.lock_subs();
        let Some(list) = subs.get_mut(target) else {
            return;
        };
        for sub in list.iter_mut() {
            if let Some(chunk) = sub.assembler.push(data) {
                let _ = sub.tx.send(chunk);
            }
        }
    }

    fn subscriber_count(&self) -> usize {
        self.lock_subs().values().map(Vec::len).sum()
    }
}

enum StdinCmd {
    Line(String),
    Close,
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    stdin_tx: mpsc::UnboundedSender<StdinCmd>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Handle returned by [`ControlModeHub::subscribe`]; pass it back to
/// [`ControlModeHub::unsubscribe`] to release the pane.
pub struct ControlSubscription {
    pub session: String,
    pub target: String,
    id: u64,
}

pub struct ControlModeHub {
    exec: TmuxExecutor,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_sub: AtomicU64,
    cancel: CancellationToken,
}

impl ControlModeHub {
    pub fn new(exec: TmuxExecutor, cancel: CancellationToken) -> Self {
        Self {
            exec,
            sessions: Mutex::new(HashMap::new()),
            next_sub: AtomicU64::new(1),
            cancel,
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to realtime output of `target`. Spawns the session's
    /// control-mode child on first use and refreshes the pane map.
    pub async fn subscribe(
        &self,
        target: &str,
        tx: mpsc::UnboundedSender<Bytes>,
    ) -> Result<ControlSubscription, TmuxError> {
        let session = session_of(target);
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);

        let shared = {
            let mut sessions = self.lock_sessions();
            if !sessions.contains_key(&session) {
                let handle = self.spawn_session(&session)?;
                sessions.insert(session.clone(), handle);
            }
            let handle = match sessions.get(&session) {
                Some(h) => h,
                None => return Err(TmuxError::CommandFailed("session vanished".into())),
            };
            let mut subs = handle.shared.lock_subs();
            subs.entry(target.to_owned()).or_default().push(Subscriber {
                id,
                tx,
                assembler: Utf8Assembler::new(),
            });
            Arc::clone(&handle.shared)
        };

        refresh_pane_map(&self.exec, &shared).await;

        Ok(ControlSubscription {
            session,
            target: target.to_owned(),
            id,
        })
    }

    /// Drop one subscription. The session child is detached and reaped
    /// when its last subscriber leaves.
    pub async fn unsubscribe(&self, sub: ControlSubscription) {
        let finished = {
            let mut sessions = self.lock_sessions();
            let Some(handle) = sessions.get(&sub.session) else {
                return;
            };
            {
                let mut subs = handle.shared.lock_subs();
                if let Some(list) = subs.get_mut(&sub.target) {
                    list.retain(|s| s.id != sub.id);
                    if list.is_empty() {
                        subs.remove(&sub.target);
                    }
                }
            }
            if handle.shared.subscriber_count() == 0 {
                sessions.remove(&sub.session)
            } else {
                None
            }
        };

        if let Some(handle) = finished {
            tracing::debug!(session = %handle.shared.session, "control hub: detaching idle session child");
            let _ = handle.stdin_tx.send(StdinCmd::Line("detach-client".into()));
            let _ = handle.stdin_tx.send(StdinCmd::Close);
            handle.cancel.cancel();
        }
    }

    /// Tear down every session child.
    pub fn shutdown(&self) {
        let mut sessions = self.lock_sessions();
        for (_, handle) in sessions.drain() {
            let _ = handle.stdin_tx.send(StdinCmd::Line("detach-client".into()));
            let _ = handle.stdin_tx.send(StdinCmd::Close);
            handle.cancel.cancel();
        }
    }

    fn spawn_session(&self, session: &str) -> Result<SessionHandle, TmuxError> {
        let mut cmd = Command::new(self.exec.tmux_bin());
        for arg in self.exec.base_args() {
            cmd.arg(arg);
        }
        cmd.args(["-C", "attach-session", "-t", session])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TmuxError::NotFound
            } else {
                TmuxError::Io(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TmuxError::CommandFailed("control child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TmuxError::CommandFailed("control child has no stdout".into()))?;

        let shared = Arc::new(SessionShared {
            session: session.to_owned(),
            subs: Mutex::new(HashMap::new()),
            pane_map: Mutex::new(HashMap::new()),
        });
        let cancel = self.cancel.child_token();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();

        tokio::spawn(stdin_writer(stdin, stdin_rx));
        tokio::spawn(session_reader(
            self.exec.clone(),
            Arc::clone(&shared),
            stdout,
            cancel.clone(),
        ));
        tokio::spawn(child_reaper(child, cancel.clone()));

        tracing::debug!(session, "control hub: spawned control-mode child");
        Ok(SessionHandle {
            shared,
            stdin_tx,
            cancel,
        })
    }
}

fn session_of(target: &str) -> String {
    target.split(':').next().unwrap_or(target).to_owned()
}

async fn refresh_pane_map(exec: &TmuxExecutor, shared: &Arc<SessionShared>) {
    let out = match exec
        .run(&["list-panes", "-s", "-t", &shared.session, "-F", PANE_MAP_FORMAT])
        .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(session = %shared.session, error = %e, "control hub: pane map refresh failed");
            return;
        }
    };
    let mut map = HashMap::new();
    for line in out.lines() {
        if let Some((pane_id, target)) = line.split_once('\t') {
            map.insert(pane_id.to_owned(), target.to_owned());
        }
    }
    *shared.lock_map() = map;
}

async fn stdin_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinCmd>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StdinCmd::Line(line) => {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    break;
                }
                let _ = stdin.flush().await;
            }
            StdinCmd::Close => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn session_reader(
    exec: TmuxExecutor,
    shared: Arc<SessionShared>,
    stdout: tokio::process::ChildStdout,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = %shared.session, error = %e, "control hub: read error");
                break;
            }
        };

        match parse_line(&line) {
            Some(ControlEvent::Output { pane_id, data })
            | Some(ControlEvent::ExtendedOutput { pane_id, data }) => {
                let target = match shared.resolve(&pane_id) {
                    Some(t) => Some(t),
                    None => {
                        refresh_pane_map(&exec, &shared).await;
                        shared.resolve(&pane_id)
                    }
                };
                if let Some(target) = target {
                    shared.deliver(&target, &data);
                }
            }
            Some(ControlEvent::Exit { reason }) => {
                tracing::debug!(session = %shared.session, reason, "control hub: child exited");
                break;
            }
            Some(ControlEvent::Other(other)) => {
                if is_unknown_pane_line(&other) {
                    refresh_pane_map(&exec, &shared).await;
                }
            }
            None => {}
        }
    }
}

async fn child_reaper(mut child: tokio::process::Child, cancel: CancellationToken) {
    tokio::select! {
        _ = child.wait() => {}
        _ = cancel.cancelled() => {
            // Give detach-client a moment, then force the exit.
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_map(pairs: &[(&str, &str)]) -> Arc<SessionShared> {
        let shared = Arc::new(SessionShared {
            session: "e2e".into(),
            subs: Mutex::new(HashMap::new()),
            pane_map: Mutex::new(HashMap::new()),
        });
        let mut map = shared.lock_map();
        for (id, target) in pairs {
            map.insert((*id).to_owned(), (*target).to_owned());
        }
        drop(map);
        shared
    }

    fn attach(shared: &SessionShared, target: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        shared.lock_subs().entry(target.to_owned()).or_default().push(Subscriber {
            id: 1,
            tx,
            assembler: Utf8Assembler::new(),
        });
        rx
    }

    #[test]
    fn output_line_routes_to_target_subscriber() {
        let shared = shared_with_map(&[("%1", "e2e:0.0")]);
        let mut rx = attach(&shared, "e2e:0.0");

        let ev = parse_line(r"%output %1 hi\012").unwrap();
        let ControlEvent::Output { pane_id, data } = ev else {
            panic!("expected Output");
        };
        let target = shared.resolve(&pane_id).unwrap();
        shared.deliver(&target, &data);

        let chunk = rx.try_recv().unwrap();
        assert_eq!(&chunk[..], b"hi\n");
        assert!(rx.try_recv().is_err(), "exactly one delivery");
    }

    #[test]
    fn unmapped_pane_is_not_delivered() {
        let shared = shared_with_map(&[("%1", "e2e:0.0")]);
        let mut rx = attach(&shared, "e2e:0.0");
        assert!(shared.resolve("%9").is_none());
        // Nothing delivered for the unknown pane.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn split_rune_is_merged_into_one_delivery() {
        let shared = shared_with_map(&[("%1", "e2e:0.0")]);
        let mut rx = attach(&shared, "e2e:0.0");

        // "你" arrives as \344\275 then \240.
        let first = crate::control::decode_escaped(r"\344\275");
        let second = crate::control::decode_escaped(r"\240");
        shared.deliver("e2e:0.0", &first);
        assert!(rx.try_recv().is_err(), "incomplete rune is held back");
        shared.deliver("e2e:0.0", &second);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(std::str::from_utf8(&chunk[..]).unwrap(), "你");
    }

    #[test]
    fn assembler_holds_only_the_incomplete_tail() {
        let mut asm = Utf8Assembler::new();
        // ASCII + first two bytes of a 3-byte rune.
        let mut data = b"ok".to_vec();
        data.extend_from_slice(&"你".as_bytes()[..2]);
        let out = asm.push(&data).unwrap();
        assert_eq!(&out[..], b"ok");
        assert_eq!(asm.pending_len(), 2);
        let out = asm.push(&"你".as_bytes()[2..]).unwrap();
        assert_eq!(std::str::from_utf8(&out[..]).unwrap(), "你");
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn invalid_byte_is_forwarded_verbatim() {
        let mut asm = Utf8Assembler::new();
        // 0x80 is a continuation byte with no lead: forwarded, not held.
        let out = asm.push(&[0x80, b'a']).unwrap();
        assert_eq!(&out[..], &[0x80, b'a']);
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn four_byte_rune_across_three_pushes() {
        let mut asm = Utf8Assembler::new();
        let emoji = "😀".as_bytes(); // 4 bytes
        assert!(asm.push(&emoji[..1]).is_none());
        assert!(asm.push(&emoji[1..3]).is_none());
        let out = asm.push(&emoji[3..]).unwrap();
        assert_eq!(&out[..], emoji);
    }

    #[test]
    fn session_of_strips_window_and_pane() {
        assert_eq!(session_of("e2e:0.0"), "e2e");
        assert_eq!(session_of("plain"), "plain");
    }

    #[test]
    fn deliver_fans_out_to_all_subscribers_of_target() {
        let shared = shared_with_map(&[("%1", "e2e:0.0")]);
        let mut rx1 = attach(&shared, "e2e:0.0");
        let mut rx2 = attach(&shared, "e2e:0.0");
        let mut other = attach(&shared, "e2e:0.1");

        shared.deliver("e2e:0.0", b"data");
        assert_eq!(&rx1.try_recv().unwrap()[..], b"data");
        assert_eq!(&rx2.try_recv().unwrap()[..], b"data");
        assert!(other.try_recv().is_err());
    }
}
