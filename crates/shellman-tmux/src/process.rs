//! Pane process inspection.
//!
//! tmux only reports the pane's root process (`pane_current_command`),
//! which for an interactive pane is usually the shell. The status pump
//! wants the thing the user is actually running, so we walk the pane
//! PID's descendants and pick a better answer:
//!
//! - prefer the deepest non-shell process;
//! - when an interpreter (`node`, `python`, …) launches a script, report
//!   the script's filename stem instead of the interpreter.

use std::path::Path;

const SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh"];
const INTERPRETERS: &[&str] = &[
    "node", "python", "python3", "ruby", "perl", "deno", "bun",
];

/// A process as read from the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    pub args: Vec<String>,
}

/// Derive the pane's "current command" from its descendant process tree.
/// Falls back to the root's command name when nothing better exists.
pub fn current_command(pane_pid: u32, table: &[ProcEntry]) -> Option<String> {
    let root = table.iter().find(|p| p.pid == pane_pid)?;

    // Depth-first over descendants; keep the deepest non-shell entry,
    // falling back to the deepest entry of any kind.
    let mut best: Option<(&ProcEntry, usize)> = None;
    let mut deepest: Option<(&ProcEntry, usize)> = None;
    let mut stack: Vec<(&ProcEntry, usize)> = vec![(root, 0)];
    while let Some((entry, depth)) = stack.pop() {
        if deepest.map_or(true, |(_, d)| depth >= d) {
            deepest = Some((entry, depth));
        }
        if !is_shell(&entry.comm) && best.map_or(true, |(_, d)| depth >= d) {
            best = Some((entry, depth));
        }
        for child in table.iter().filter(|p| p.ppid == entry.pid && p.pid != entry.pid) {
            stack.push((child, depth + 1));
        }
    }

    let (chosen, _) = best.or(deepest)?;
    Some(describe(chosen))
}

/// Read the live process table. Linux-only `/proc` walk; errors collapse
/// to an empty table so callers degrade to tmux's own metadata.
pub fn read_proc_table() -> Vec<ProcEntry> {
    let mut table = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // stat: pid (comm) state ppid …; comm may contain spaces.
        let Some(open) = stat.find('(') else { continue };
        let Some(close) = stat.rfind(')') else { continue };
        let comm = stat[open + 1..close].to_owned();
        let rest: Vec<&str> = stat[close + 1..].split_whitespace().collect();
        let Some(ppid) = rest.get(1).and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let args = std::fs::read(entry.path().join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        table.push(ProcEntry {
            pid,
            ppid,
            comm,
            args,
        });
    }
    table
}

fn is_shell(comm: &str) -> bool {
    SHELLS.contains(&comm)
}

fn is_interpreter(comm: &str) -> bool {
    INTERPRETERS.contains(&comm)
}

fn describe(entry: &ProcEntry) -> String {
    if is_interpreter(&entry.comm) {
        if let Some(script) = entry
            .args
            .iter()
            .skip(1)
            .find(|a| !a.starts_with('-') && looks_like_path(a))
        {
            if let Some(stem) = Path::new(script).file_stem().and_then(|s| s.to_str()) {
                return stem.to_owned();
            }
        }
    }
    entry.comm.clone()
}

fn looks_like_path(arg: &str) -> bool {
    arg.contains('/') || arg.contains('.')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
