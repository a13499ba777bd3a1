//! # Lumen Build Native
//!
//! Native build pipeline for Lumen component applications: an incremental
//! program builder, a per-unit compilation cache, virtual resource specifier
//! encoding/resolution, a transform worker pool, and the structural
//! pattern-rewrite passes applied to emitted units.
//!
//! ## Pipeline Invariants
//!
//! 1. **Drain, don't scan**: the affected set comes from repeatedly asking the
//!    program host for its next outdated unit until it answers `None`.
//! 2. **Pass or ignore**: resource specifier decoding and every rewrite pass
//!    either fully recognizes its input or leaves it byte-identical.
//! 3. **Unit-scoped failure**: a panic, parse error, or emit failure in one
//!    unit produces a diagnostic for that unit and never aborts the build.
//!    Only host initialization and pool spawning are fatal.
//! 4. **Cache keys are closed over options**: any change to the build options
//!    changes the cache namespace, so stale artifacts can never replay.

mod cache;
mod diagnostics;
mod emit;
mod program;
mod resolution;
mod resource;
mod rewrite;
mod worker;

#[cfg(test)]
mod worker_tests;

pub use cache::{CacheEntry, CachedLoad, UnitCache, STAGE_EMIT, STAGE_TRANSFORM};
pub use diagnostics::{
    Diagnostic, DiagnosticsAggregator, Severity, STAGE_CONFIGURATION, STAGE_SEMANTIC,
    STAGE_SYNTACTIC,
};
pub use emit::{
    encode_resource_usages, BuildOptions, BuildPipeline, BuildSummary, FatalBuildError,
};
pub use program::{
    discover_units, BuildOutput, EmittedUnit, IncrementalProgramBuilder, ParseHandle,
    ProgramError, ProgramHandle, ProgramHost, SourceUnit,
};
pub use resolution::{
    LoadedResource, LoaderHint, ResolvedResource, ResourceResolutionLayer, RESOLUTION_NAMESPACE,
};
pub use resource::{
    decode, encode, ResourceKind, ResourceOrigin, ResourceReference, RESOURCE_SCHEME,
};
pub use rewrite::{PatternRewriteEngine, RewriteError, RewriteOutcome, PURE_MARKER};
pub use worker::{
    strip_source_map_comments, PoolError, TransformError, TransformFlags, TransformRequest,
    TransformResult, TransformStrategies, TransformTicket, TransformWorkerPool, UnitTransform,
};
