//! End-to-end scenarios.
//!
//! Every scenario builds its own [`Scheduler`] from the given configuration,
//! logs one JSONL entry per step, and returns a serializable report with a
//! `passed` verdict.

use std::path::{Path, PathBuf};
use std::time::Instant;

use frankenffi_abi::{FunctionDescriptor, Linker, NativeValue};
use frankenffi_core::context::{self, ContextKey};
use frankenffi_core::structured_log::{LogEmitter, LogLevel, Outcome};
use frankenffi_core::{Scheduler, invoke, yield_now};
use frankenffi_membrane::{
    ArenaKind, FfiError, MetricsSnapshot, Primitive, RuntimeConfig, global_metrics, open_arena,
};
use serde::Serialize;

use crate::HarnessError;

/// Context key carrying the request id through a scenario task.
pub static REQUEST_ID: ContextKey<String> = ContextKey::new("request_id");

/// Byte length of each request's confined scratch segment.
pub const REQUEST_SEGMENT_LEN: usize = 20;

const STORM_SEGMENT_LEN: usize = 8;

/// Counters worth reporting after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsView {
    pub arenas_opened: u64,
    pub arenas_closed: u64,
    pub native_calls: u64,
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub suspensions: u64,
}

impl From<MetricsSnapshot> for MetricsView {
    fn from(snap: MetricsSnapshot) -> Self {
        Self {
            arenas_opened: snap.arenas_opened,
            arenas_closed: snap.arenas_closed,
            native_calls: snap.native_calls,
            tasks_spawned: snap.tasks_spawned,
            tasks_completed: snap.tasks_completed,
            tasks_failed: snap.tasks_failed,
            suspensions: snap.suspensions,
        }
    }
}

/// What one request task observed.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub task: u64,
    pub context_after_call: Option<String>,
    pub segment_contents: Option<String>,
    pub native_pid: Option<i32>,
    pub arena_released: bool,
    pub error: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub carriers: usize,
    pub requests: Vec<RequestOutcome>,
    pub metrics: MetricsView,
    pub passed: bool,
}

/// Run one task per request id. Each task binds its id in context, writes
/// it into a confined 20-byte segment, calls `getpid` through the native
/// pool, and reads both back after resuming.
pub fn run_request_scenario(
    config: &RuntimeConfig,
    requests: &[&str],
    log: &mut LogEmitter,
) -> Result<ScenarioReport, HarnessError> {
    let scheduler = Scheduler::new(config)?;
    let getpid = Linker::from_config(config)?
        .bind_symbol("getpid", &FunctionDescriptor::returning(Primitive::I32, []))?;
    let started = Instant::now();

    let handles: Vec<_> = requests
        .iter()
        .map(|req| {
            let getpid = getpid.clone();
            context::with(&REQUEST_ID, (*req).to_string(), || {
                scheduler.spawn(async move {
                    let arena = open_arena(ArenaKind::Confined);
                    let seg = arena.allocate(REQUEST_SEGMENT_LEN)?;
                    // Full-width write; the id is NUL-padded.
                    let mut payload = [0_u8; REQUEST_SEGMENT_LEN];
                    let id = context::get(&REQUEST_ID)?;
                    for (dst, src) in payload.iter_mut().zip(id.bytes().take(REQUEST_SEGMENT_LEN - 1)) {
                        *dst = src;
                    }
                    seg.write(0, &payload)?;
                    let pid = invoke(&getpid, &[]).await?;
                    let after = context::get(&REQUEST_ID)?;
                    let stored = seg.read_cstr(0)?;
                    Ok::<_, FfiError>((after, stored, pid, seg))
                })
            })
        })
        .collect();

    let expected_pid = std::process::id() as i32;
    let mut outcomes = Vec::with_capacity(requests.len());
    for (handle, req) in handles.into_iter().zip(requests) {
        let task = handle.id().as_u64();
        let outcome = match handle.join_blocking() {
            Ok((after, stored, pid, seg)) => {
                let native_pid = match pid {
                    NativeValue::I32(pid) => Some(pid),
                    _ => None,
                };
                let ok = after == *req
                    && stored == *req
                    && native_pid == Some(expected_pid)
                    && !seg.is_alive();
                RequestOutcome {
                    request_id: (*req).to_string(),
                    task,
                    context_after_call: Some(after),
                    segment_contents: Some(stored),
                    native_pid,
                    arena_released: !seg.is_alive(),
                    error: None,
                    outcome: if ok { Outcome::Pass } else { Outcome::Fail },
                }
            }
            Err(err) => RequestOutcome {
                request_id: (*req).to_string(),
                task,
                context_after_call: None,
                segment_contents: None,
                native_pid: None,
                arena_released: false,
                error: Some(err.to_string()),
                outcome: Outcome::Fail,
            },
        };

        let level = if outcome.outcome == Outcome::Pass {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let entry = log
            .entry(level, "scenario.request")
            .with_task(task)
            .with_symbol("getpid")
            .with_outcome(outcome.outcome)
            .with_message(&outcome.request_id)
            .with_duration_us(started.elapsed().as_micros() as u64);
        log.emit(&entry)?;
        outcomes.push(outcome);
    }
    scheduler.shutdown();

    let passed = !outcomes.is_empty() && outcomes.iter().all(|o| o.outcome == Outcome::Pass);
    Ok(ScenarioReport {
        scenario: "request-scoped",
        carriers: scheduler.stats().carriers,
        requests: outcomes,
        metrics: global_metrics().snapshot().into(),
        passed,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StormReport {
    pub tasks: usize,
    pub carriers: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub peak_active_carriers: usize,
    pub metrics: MetricsView,
    pub passed: bool,
}

/// Spawn `tasks` tasks that each open a confined arena, write an 8-byte
/// segment, yield once, read it back and close the arena. Checks the
/// carrier pool never ran more than `config.carriers` of them at a time.
pub fn run_storm(config: &RuntimeConfig, tasks: usize, log: &mut LogEmitter) -> Result<StormReport, HarnessError> {
    let scheduler = Scheduler::new(config)?;
    let started = Instant::now();

    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            scheduler.spawn(async move {
                let arena = open_arena(ArenaKind::Confined);
                let seg = arena.allocate(STORM_SEGMENT_LEN)?;
                seg.write(0, &(i as u64).to_ne_bytes())?;
                yield_now().await;
                let stored = seg.read(0, STORM_SEGMENT_LEN)?;
                arena.close()?;
                Ok::<_, FfiError>(stored == (i as u64).to_ne_bytes())
            })
        })
        .collect();
    let (completed, failed) = handles
        .into_iter()
        .fold((0, 0), |(ok, bad), handle| match handle.join_blocking() {
            Ok(true) => (ok + 1, bad),
            Ok(false) | Err(_) => (ok, bad + 1),
        });

    let elapsed = started.elapsed();
    let stats = scheduler.stats();
    scheduler.shutdown();
    let passed = completed == tasks && stats.peak_active_carriers <= stats.carriers;

    let entry = log
        .entry(if passed { LogLevel::Info } else { LogLevel::Error }, "scenario.storm")
        .with_outcome(if passed { Outcome::Pass } else { Outcome::Fail })
        .with_duration_us(elapsed.as_micros() as u64)
        .with_details(serde_json::json!({
            "tasks": tasks,
            "completed": completed,
            "peak_active_carriers": stats.peak_active_carriers,
        }));
    log.emit(&entry)?;

    Ok(StormReport {
        tasks,
        carriers: stats.carriers,
        completed,
        failed,
        elapsed_ms: elapsed.as_millis() as u64,
        peak_active_carriers: stats.peak_active_carriers,
        metrics: global_metrics().snapshot().into(),
        passed,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub symbol: String,
    pub found: bool,
    pub address: Option<String>,
    pub origin: Option<String>,
    pub searched_libraries: Vec<String>,
    pub error: Option<String>,
    pub passed: bool,
}

/// Resolve `symbol`, searching `library` (if any) before the configured path.
pub fn probe(
    config: &RuntimeConfig,
    symbol: &str,
    library: Option<&Path>,
    log: &mut LogEmitter,
) -> Result<ProbeReport, HarnessError> {
    let searched_libraries: Vec<String> = library
        .into_iter()
        .chain(config.library_path.iter().map(PathBuf::as_path))
        .map(|p| p.display().to_string())
        .collect();
    let resolved = library
        .into_iter()
        .chain(config.library_path.iter().map(PathBuf::as_path))
        .try_fold(Linker::new(), Linker::with_library)
        .and_then(|linker| linker.resolve(symbol));

    let report = match resolved {
        Ok(sym) => ProbeReport {
            symbol: symbol.to_string(),
            found: true,
            address: Some(format!("{:#x}", sym.address())),
            origin: Some(sym.origin().label()),
            searched_libraries,
            error: None,
            passed: true,
        },
        Err(err) => ProbeReport {
            symbol: symbol.to_string(),
            found: false,
            address: None,
            origin: None,
            searched_libraries,
            error: Some(err.to_string()),
            passed: false,
        },
    };

    let mut entry = log
        .entry(
            if report.found { LogLevel::Info } else { LogLevel::Warn },
            "scenario.probe",
        )
        .with_symbol(symbol)
        .with_outcome(if report.found { Outcome::Pass } else { Outcome::Fail });
    if let Some(err) = &report.error {
        entry = entry.with_message(err);
    }
    log.emit(&entry)?;
    Ok(report)
}
