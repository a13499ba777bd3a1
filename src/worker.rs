//! Transform Worker Pool for Lumen Build
//!
//! Fans independent per-unit transform requests out to a fixed pool of worker
//! threads. Requests are self-contained input/output pairs; workers share no
//! mutable state with the control thread. Request lifecycle:
//! Queued -> Dispatched -> (Completed | Failed).
//!
//! Failure domains are isolated: a panic inside one transform fails only that
//! request, the worker survives, and any worker thread that does die is
//! replaced before the next dispatch. The internal queue is unbounded by
//! contract; callers apply their own backpressure if they need a cap.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::diagnostics::{Diagnostic, STAGE_TRANSFORM};
use crate::resource::RESOURCE_SCHEME;
use crate::rewrite::{PatternRewriteEngine, RewriteError, RewriteOutcome};

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST / RESULT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformFlags {
    pub needs_linking: bool,
    pub needs_async_lowering: bool,
    pub needs_optimization: bool,
}

impl TransformFlags {
    pub fn any(&self) -> bool {
        self.needs_linking || self.needs_async_lowering || self.needs_optimization
    }
}

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub path: String,
    pub content: String,
    pub flags: TransformFlags,
    pub strip_source_maps: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub content: String,
    /// Resource specifiers the transformed unit depends on.
    pub dependencies: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("worker crashed while transforming {path}: {message}")]
    WorkerPanic { path: String, message: String },
    #[error("transform pool is shut down")]
    PoolShutDown,
}

/// Pool creation failure. Fatal for the whole build.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn transform worker: {0}")]
    Spawn(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONAL TRANSFORM STRATEGIES
// ═══════════════════════════════════════════════════════════════════════════════

/// A per-unit transform step. `Ok(None)` means the step had nothing to do.
pub trait UnitTransform: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, path: &str, content: &str) -> Result<Option<String>, String>;
}

/// Default strategy for capabilities that are not installed.
struct NoopTransform;

impl UnitTransform for NoopTransform {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn apply(&self, _path: &str, _content: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

/// Optional sub-capabilities, constructed once by the orchestrator and cached
/// for the life of the pool. Both default to no-ops.
#[derive(Clone)]
pub struct TransformStrategies {
    pub linker: Arc<dyn UnitTransform>,
    pub async_lowerer: Arc<dyn UnitTransform>,
}

impl Default for TransformStrategies {
    fn default() -> Self {
        TransformStrategies {
            linker: Arc::new(NoopTransform),
            async_lowerer: Arc::new(NoopTransform),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TICKET
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a dispatched (or fast-pathed) request.
pub enum TransformTicket {
    /// Fast path: resolved on the control thread without touching a worker.
    Completed(TransformResult),
    Pending(Receiver<Result<TransformResult, TransformError>>),
}

impl TransformTicket {
    pub fn wait(self) -> Result<TransformResult, TransformError> {
        match self {
            TransformTicket::Completed(result) => Ok(result),
            TransformTicket::Pending(rx) => match rx.recv() {
                Ok(outcome) => outcome,
                // Reply sender dropped without an answer: the worker died
                // mid-request.
                Err(_) => Err(TransformError::PoolShutDown),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════════

struct Job {
    request: TransformRequest,
    reply: Sender<Result<TransformResult, TransformError>>,
}

pub struct TransformWorkerPool {
    sender: Sender<Job>,
    job_receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    engine: Arc<PatternRewriteEngine>,
    strategies: Arc<TransformStrategies>,
}

impl TransformWorkerPool {
    /// Pool bounded by available parallelism.
    pub fn new(
        engine: PatternRewriteEngine,
        strategies: TransformStrategies,
    ) -> Result<Self, PoolError> {
        let size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_size(size, engine, strategies)
    }

    pub fn with_size(
        size: usize,
        engine: PatternRewriteEngine,
        strategies: TransformStrategies,
    ) -> Result<Self, PoolError> {
        let (sender, job_receiver) = unbounded::<Job>();
        let engine = Arc::new(engine);
        let strategies = Arc::new(strategies);

        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            workers.push(spawn_worker(
                id,
                job_receiver.clone(),
                engine.clone(),
                strategies.clone(),
            )?);
        }

        Ok(TransformWorkerPool {
            sender,
            job_receiver,
            workers: Mutex::new(workers),
            engine,
            strategies,
        })
    }

    /// Dispatch a request. The fast path resolves flagless requests on the
    /// calling thread: no worker hop, no copy, output byte-identical to the
    /// input apart from the dependency scan.
    pub fn run(&self, request: TransformRequest) -> TransformTicket {
        if !request.flags.any() && !request.strip_source_maps {
            let dependencies = extract_resource_dependencies(&request.content);
            return TransformTicket::Completed(TransformResult {
                content: request.content,
                dependencies,
                diagnostics: Vec::new(),
            });
        }

        self.respawn_dead_workers();

        let (reply, rx) = bounded(1);
        // A failed send drops the reply sender, which surfaces to the caller
        // as PoolShutDown on wait().
        let _ = self.sender.send(Job { request, reply });
        TransformTicket::Pending(rx)
    }

    /// Replace any worker whose thread has exited. Panics inside a transform
    /// are caught per job, so this only fires for genuine thread death.
    fn respawn_dead_workers(&self) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in workers.iter_mut() {
            if slot.is_finished() {
                eprintln!("[LumenNative] Transform worker died; spawning replacement");
                if let Ok(replacement) = spawn_worker(
                    usize::MAX,
                    self.job_receiver.clone(),
                    self.engine.clone(),
                    self.strategies.clone(),
                ) {
                    *slot = replacement;
                }
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        match self.workers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

fn spawn_worker(
    id: usize,
    receiver: Receiver<Job>,
    engine: Arc<PatternRewriteEngine>,
    strategies: Arc<TransformStrategies>,
) -> Result<JoinHandle<()>, PoolError> {
    let handle = thread::Builder::new()
        .name(format!("lumen-transform-{}", id))
        .spawn(move || {
            for job in receiver.iter() {
                let path = job.request.path.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    transform_unit(&engine, &strategies, job.request)
                }));
                let reply = match outcome {
                    Ok(result) => Ok(result),
                    Err(payload) => Err(TransformError::WorkerPanic {
                        path,
                        message: panic_message(payload),
                    }),
                };
                // Receiver may have been dropped; nothing to do then.
                let _ = job.reply.send(reply);
            }
        })?;
    Ok(handle)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-UNIT TRANSFORM
// ═══════════════════════════════════════════════════════════════════════════════

fn transform_unit(
    engine: &PatternRewriteEngine,
    strategies: &TransformStrategies,
    request: TransformRequest,
) -> TransformResult {
    let mut content = request.content;
    let mut diagnostics = Vec::new();

    if request.flags.needs_linking {
        apply_strategy(
            strategies.linker.as_ref(),
            &request.path,
            &mut content,
            &mut diagnostics,
        );
    }
    if request.flags.needs_async_lowering {
        apply_strategy(
            strategies.async_lowerer.as_ref(),
            &request.path,
            &mut content,
            &mut diagnostics,
        );
    }

    if request.flags.needs_optimization {
        match engine.apply_all(&content) {
            Ok(RewriteOutcome::Changed(next)) => content = next,
            Ok(RewriteOutcome::Unchanged) => {}
            // Unit-scoped: leave the code unmodified and keep building.
            Err(RewriteError::Parse(message)) => {
                diagnostics.push(
                    Diagnostic::warning(
                        STAGE_TRANSFORM,
                        format!("skipped optimization passes: {}", message),
                    )
                    .with_file(&request.path),
                );
            }
        }
    }

    if request.strip_source_maps {
        content = strip_source_map_comments(&content);
    }

    let dependencies = extract_resource_dependencies(&content);
    TransformResult {
        content,
        dependencies,
        diagnostics,
    }
}

fn apply_strategy(
    strategy: &dyn UnitTransform,
    path: &str,
    content: &mut String,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match strategy.apply(path, content) {
        Ok(Some(next)) => *content = next,
        Ok(None) => {}
        Err(message) => {
            diagnostics.push(
                Diagnostic::warning(
                    STAGE_TRANSFORM,
                    format!("{} step failed: {}", strategy.name(), message),
                )
                .with_file(path),
            );
        }
    }
}

pub fn strip_source_map_comments(content: &str) -> String {
    lazy_static! {
        static ref SOURCE_MAP_RE: Regex =
            Regex::new(r"(?m)^[ \t]*//[#@][ \t]*sourceMappingURL=.*\r?\n?").unwrap();
    }
    SOURCE_MAP_RE.replace_all(content, "").to_string()
}

fn extract_resource_dependencies(content: &str) -> Vec<String> {
    lazy_static! {
        static ref DEP_RE: Regex =
            Regex::new(&format!(r#""({}:[^"]+)""#, RESOURCE_SCHEME)).unwrap();
    }
    let mut deps: Vec<String> = DEP_RE
        .captures_iter(content)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
