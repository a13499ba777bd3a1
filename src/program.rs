//! Incremental Program Builder for Lumen Build
//!
//! Wraps the external "build a type-checked program" capability. The
//! capability is constructor-injected and loaded once for the life of the
//! builder; it performs the actual semantic analysis and unit-level reuse.
//! This module owns the source units, detects which of them changed between
//! builds, and drains the program's outdated-unit queue into the affected set.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::UnitCache;
use crate::diagnostics::{Diagnostic, DiagnosticsAggregator};

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE UNITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque handle into the host's parsed-representation store.
pub type ParseHandle = u64;

/// Opaque handle to a type-checked program owned by the host.
pub type ProgramHandle = u64;

/// One source file tracked by the incremental builder. Owned exclusively by
/// `IncrementalProgramBuilder`; mutated only on change detection.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: String,
    pub text: String,
    /// Bumped every time change detection observes new content.
    pub version: u64,
    pub fingerprint: String,
    pub parsed: Option<ParseHandle>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HOST CAPABILITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitted output for one unit, before resource resolution and transforms.
#[derive(Debug, Clone)]
pub struct EmittedUnit {
    pub path: String,
    pub code: String,
    pub source_map: Option<String>,
}

/// The external program-building capability. Injected into the builder and
/// initialized once per process; the builder never reads it from shared
/// process state.
pub trait ProgramHost {
    /// Load the capability. Failure here is fatal for the whole build.
    fn initialize(&mut self) -> Result<(), String>;

    /// Build (or incrementally rebuild) a type-checked program over the given
    /// units, reusing the prior program when supplied.
    fn create_program(
        &mut self,
        units: &[SourceUnit],
        prior: Option<ProgramHandle>,
    ) -> Result<ProgramHandle, String>;

    /// Next unit whose semantic diagnostics are outdated, or `None` when the
    /// program has drained. A single change may affect a chain of dependents
    /// that is only discoverable by asking repeatedly.
    fn next_outdated_unit(&mut self, program: ProgramHandle) -> Option<String>;

    fn emit_unit(&mut self, program: ProgramHandle, path: &str) -> Result<EmittedUnit, String>;

    fn configuration_diagnostics(&mut self, program: ProgramHandle) -> Vec<Diagnostic>;

    fn syntactic_diagnostics(&mut self, program: ProgramHandle, path: &str) -> Vec<Diagnostic>;

    fn semantic_diagnostics(&mut self, program: ProgramHandle, path: &str) -> Vec<Diagnostic>;

    /// Optional parsed-representation handle for a unit, if the host keeps one.
    fn parse_unit(&mut self, _path: &str, _text: &str) -> Option<ParseHandle> {
        None
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("program host failed to initialize: {0}")]
    HostInit(String),
    #[error("program build failed: {0}")]
    Build(String),
    #[error("emit failed for {path}: {message}")]
    Emit { path: String, message: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct BuildOutput {
    pub program: ProgramHandle,
    /// Units whose previously-computed diagnostics/output are no longer
    /// valid, in drain order. Lifetime: one build cycle.
    pub affected: Vec<String>,
}

type UnitLoader = Box<dyn Fn(&str) -> std::io::Result<String>>;

pub struct IncrementalProgramBuilder {
    host: Box<dyn ProgramHost>,
    loader: UnitLoader,
    initialized: bool,
    units: HashMap<String, SourceUnit>,
    prior_program: Option<ProgramHandle>,
}

impl IncrementalProgramBuilder {
    pub fn new(host: Box<dyn ProgramHost>) -> Self {
        Self::with_loader(host, Box::new(|path| fs::read_to_string(path)))
    }

    /// Builder with a custom unit loader. Tests and in-memory hosts use this
    /// instead of the filesystem.
    pub fn with_loader(host: Box<dyn ProgramHost>, loader: UnitLoader) -> Self {
        IncrementalProgramBuilder {
            host,
            loader,
            initialized: false,
            units: HashMap::new(),
            prior_program: None,
        }
    }

    /// Run one incremental build cycle: sync the unit set against the entry
    /// list, invalidate the cache for changed paths, rebuild the program
    /// reusing the prior one, and drain the affected set.
    pub fn build(
        &mut self,
        entry_units: &[String],
        cache: &mut UnitCache,
    ) -> Result<BuildOutput, ProgramError> {
        if !self.initialized {
            self.host.initialize().map_err(ProgramError::HostInit)?;
            self.initialized = true;
        }

        let changed = self.sync_units(entry_units);
        cache.invalidate(&changed);

        let mut unit_list: Vec<SourceUnit> = self.units.values().cloned().collect();
        unit_list.sort_by(|a, b| a.path.cmp(&b.path));

        let program = self
            .host
            .create_program(&unit_list, self.prior_program.take())
            .map_err(ProgramError::Build)?;

        // Drain loop, not a fixed-size scan: each answer can expose further
        // dependents. The seen-set guards against a host that never drains.
        let mut affected = Vec::new();
        let mut seen = HashSet::new();
        while let Some(path) = self.host.next_outdated_unit(program) {
            if !seen.insert(path.clone()) {
                eprintln!(
                    "[LumenNative] Program host repeated outdated unit {}; stopping drain",
                    path
                );
                break;
            }
            affected.push(path);
        }

        self.prior_program = Some(program);
        Ok(BuildOutput { program, affected })
    }

    /// Reconcile tracked units with the entry list. Returns the set of paths
    /// whose content changed, appeared, or disappeared.
    fn sync_units(&mut self, entry_units: &[String]) -> HashSet<String> {
        let mut changed = HashSet::new();
        let entry_set: HashSet<&String> = entry_units.iter().collect();

        // Units removed from the build set are destroyed.
        let removed: Vec<String> = self
            .units
            .keys()
            .filter(|path| !entry_set.contains(path))
            .cloned()
            .collect();
        for path in removed {
            self.units.remove(&path);
            changed.insert(path);
        }

        for path in entry_units {
            let text = match (self.loader)(path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("[LumenNative] Failed to read unit {}: {}", path, e);
                    if self.units.remove(path).is_some() {
                        changed.insert(path.clone());
                    }
                    continue;
                }
            };
            let fingerprint = UnitCache::compute_fingerprint(text.as_bytes());

            match self.units.get_mut(path) {
                Some(unit) if unit.fingerprint == fingerprint => {}
                Some(unit) => {
                    unit.text = text;
                    unit.fingerprint = fingerprint;
                    unit.version += 1;
                    unit.parsed = self.host.parse_unit(path, &unit.text);
                    changed.insert(path.clone());
                }
                None => {
                    let parsed = self.host.parse_unit(path, &text);
                    self.units.insert(
                        path.clone(),
                        SourceUnit {
                            path: path.clone(),
                            text,
                            version: 0,
                            fingerprint,
                            parsed,
                        },
                    );
                    changed.insert(path.clone());
                }
            }
        }

        changed
    }

    pub fn emit(&mut self, program: ProgramHandle, path: &str) -> Result<EmittedUnit, ProgramError> {
        self.host
            .emit_unit(program, path)
            .map_err(|message| ProgramError::Emit {
                path: path.to_string(),
                message,
            })
    }

    /// Pull every host diagnostic stage for this build into the aggregator.
    pub fn gather_diagnostics(
        &mut self,
        program: ProgramHandle,
        affected: &[String],
        diagnostics: &mut DiagnosticsAggregator,
    ) {
        diagnostics.report_all(self.host.configuration_diagnostics(program));
        for path in affected {
            diagnostics.report_all(self.host.syntactic_diagnostics(program, path));
        }
        for path in affected {
            diagnostics.report_all(self.host.semantic_diagnostics(program, path));
        }
    }

    pub fn unit(&self, path: &str) -> Option<&SourceUnit> {
        self.units.get(path)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// Recursively find all source units with the given extension.
pub fn discover_units(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        if let Ok(entry) = entry {
            let path = entry.path();
            if path.is_file() {
                if let Some(ext) = path.extension() {
                    if ext == extension {
                        files.push(path.to_path_buf());
                    }
                }
            }
        }
    }
    files.sort();
    files
}
