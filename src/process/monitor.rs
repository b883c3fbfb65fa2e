//! Per-process output monitor.
//!
//! One task per tracked process: streams stdout/stderr line-by-line into the
//! per-pid log files and the tail ring, feeds the hook engine, and finalizes
//! the persisted row on exit.  Re-adopted processes (found alive after a
//! restart) get a poll-based variant that watches the log files from their
//! current offsets and probes pid liveness.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::exec::pid_alive;
use crate::hooks::{FiredHook, HookAction, HookEffect, HookEngine, SpawnBranchRequest};
use crate::store::{ProcessRow, Store};

use super::TAIL_CAPACITY;

pub(crate) struct MonitorArgs {
    pub pid: u32,
    pub child: Option<Child>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub engine: HookEngine,
    pub effects: mpsc::Sender<HookEffect>,
    pub store: Arc<Store>,
    pub tails: Arc<Mutex<HashMap<u32, VecDeque<String>>>>,
    pub kill_requested: Arc<Mutex<HashSet<u32>>>,
    pub row: ProcessRow,
}

/// Monitor a process we spawned and still hold a handle for.
pub(crate) async fn run_monitor(mut args: MonitorArgs) {
    let (tx, mut rx) = mpsc::channel::<(bool, String)>(256);
    if let Some(stdout) = args.stdout.take() {
        spawn_reader(stdout, false, tx.clone());
    }
    if let Some(stderr) = args.stderr.take() {
        spawn_reader(stderr, true, tx.clone());
    }
    drop(tx);

    let mut out_log = open_append(&args.stdout_log);
    let mut err_log = open_append(&args.stderr_log);

    // Phase 1: drain output, ticking hook timers between lines.
    loop {
        let deadline = args.engine.next_deadline();
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some((is_err, line)) => {
                    let log = if is_err { &mut err_log } else { &mut out_log };
                    if let Some(f) = log {
                        let _ = writeln!(f, "{line}");
                    }
                    push_tail(&args.tails, args.pid, &line);
                    args.engine.on_line(&line, Instant::now());
                }
                None => break,
            },
            _ = sleep_until_opt(deadline) => {
                fire_all(&mut args, None);
            }
        }
    }

    // Phase 2: streams closed; wait for the exit code, timers still live.
    let status = match args.child.take() {
        Some(mut child) => loop {
            let deadline = args.engine.next_deadline();
            tokio::select! {
                st = child.wait() => break st.ok(),
                _ = sleep_until_opt(deadline) => {
                    fire_all(&mut args, None);
                }
            }
        },
        None => None,
    };

    let exit_code = status.and_then(|s| s.code());
    finalize(&mut args, exit_code).await;
}

/// Monitor a process adopted after a restart: no child handle, so poll pid
/// liveness and tail the log files from their current offsets.
pub(crate) async fn run_adopted_monitor(mut args: MonitorArgs) {
    let mut out_offset = file_len(&args.stdout_log);
    let mut err_offset = file_len(&args.stderr_log);

    loop {
        let wake = args
            .engine
            .next_deadline()
            .map(|d| d.min(Instant::now() + Duration::from_secs(2)))
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(2));
        sleep_until_opt(Some(wake)).await;

        for line in read_new_lines(&args.stdout_log, &mut out_offset)
            .into_iter()
            .chain(read_new_lines(&args.stderr_log, &mut err_offset))
        {
            push_tail(&args.tails, args.pid, &line);
            args.engine.on_line(&line, Instant::now());
        }
        fire_all(&mut args, None);

        if !pid_alive(args.pid) {
            break;
        }
    }

    // The exit code of a re-adopted process is unknowable.
    finalize(&mut args, None).await;
}

// ─── Internals ──────────────────────────────────────────────────────────────

fn spawn_reader<R>(stream: R, is_err: bool, tx: mpsc::Sender<(bool, String)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((is_err, line)).await.is_err() {
                break;
            }
        }
    });
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(tokio::time::Instant::from_std(t)).await,
        None => std::future::pending().await,
    }
}

fn open_append(path: &Path) -> Option<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| warn!(path = %path.display(), error = %e, "cannot open log file"))
        .ok()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Read complete lines appended to `path` since `offset`.
fn read_new_lines(path: &Path, offset: &mut u64) -> Vec<String> {
    let Ok(mut f) = std::fs::File::open(path) else {
        return Vec::new();
    };
    if f.seek(SeekFrom::Start(*offset)).is_err() {
        return Vec::new();
    }
    let mut buf = String::new();
    if f.read_to_string(&mut buf).is_err() {
        return Vec::new();
    }
    // Only consume whole lines; a partial trailing line waits for more data.
    let consumed = buf.rfind('\n').map(|i| i + 1).unwrap_or(0);
    *offset += consumed as u64;
    buf[..consumed].lines().map(str::to_owned).collect()
}

fn push_tail(tails: &Mutex<HashMap<u32, VecDeque<String>>>, pid: u32, line: &str) {
    let mut map = tails.lock().expect("tail map poisoned");
    let ring = map.entry(pid).or_default();
    if ring.len() >= TAIL_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(line.to_owned());
}

fn tail_text(tails: &Mutex<HashMap<u32, VecDeque<String>>>, pid: u32) -> String {
    tails
        .lock()
        .expect("tail map poisoned")
        .get(&pid)
        .map(|d| d.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default()
}

fn fire_all(args: &mut MonitorArgs, exit_code: Option<Option<i32>>) {
    let fired = match exit_code {
        Some(code) => args.engine.on_exit(code),
        None => args.engine.on_tick(Instant::now()),
    };
    if fired.is_empty() {
        return;
    }
    let tail = tail_text(&args.tails, args.pid);
    for hook in fired {
        dispatch_fired(&args.effects, &args.row, hook, tail.clone());
    }
}

async fn finalize(args: &mut MonitorArgs, exit_code: Option<i32>) {
    let killed = args
        .kill_requested
        .lock()
        .expect("kill set poisoned")
        .remove(&args.pid);
    let status = if killed { "killed" } else { "exited" };

    debug!(pid = args.pid, status, ?exit_code, "process finished");
    // Persist terminal state and the advanced fire counts together.
    args.row.status = status.to_owned();
    args.row.exit_code = exit_code;
    args.row.callbacks = serde_json::to_value(args.engine.specs()).unwrap_or_default();
    if let Err(e) = args.store.upsert_process(&args.row) {
        warn!(pid = args.pid, error = %e, "failed to finalize process row");
    }

    fire_all(args, Some(exit_code));
}

/// Translate one fired hook into an orchestrator effect.
///
/// `StopBranch` is a no-op for background spawns — they have no foreground
/// branch waiting on them.
pub(crate) fn dispatch_fired(
    effects: &mpsc::Sender<HookEffect>,
    row: &ProcessRow,
    hook: FiredHook,
    output_tail: String,
) {
    let effect = match hook.action {
        HookAction::StopProcess => HookEffect::StopProcess { pid: row.pid },
        HookAction::StopBranch => {
            if row.spawn_type == "background" {
                return;
            }
            let Some(branch) = row.parent_branch else {
                return;
            };
            HookEffect::StopBranch {
                agent: row.agent.clone(),
                branch,
            }
        }
        HookAction::InjectContext { text } => {
            let Some(branch) = row.parent_branch else {
                return;
            };
            let text = if hook.matched_output.is_empty() {
                text
            } else {
                format!("{text}\n\nRecent output:\n{}", hook.matched_output)
            };
            HookEffect::InjectContext {
                agent: row.agent.clone(),
                branch,
                text,
            }
        }
        HookAction::SpawnBranch { instruction } => {
            HookEffect::SpawnBranch(SpawnBranchRequest {
                agent: row.agent.clone(),
                instruction,
                process_context: row.context.clone(),
                output_tail: if hook.matched_output.is_empty() {
                    output_tail
                } else {
                    hook.matched_output
                },
                recursion_depth: row.recursion_depth + 1,
                parent_branch: row.parent_branch,
            })
        }
    };
    if let Err(e) = effects.try_send(effect) {
        warn!(pid = row.pid, error = %e, "dropping hook effect (queue full or closed)");
    }
}
