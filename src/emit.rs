//! Emit Phase and Pipeline Orchestration for Lumen Build
//!
//! Ties the stages together for one build cycle: the incremental program
//! builder produces the affected set, each affected unit is emitted, its
//! component resource usages are rewritten to virtual specifiers (JIT-only
//! path), and the result goes through the transform worker pool. The unit
//! cache is consulted and populated at each stage; diagnostics from every
//! stage land in one aggregator.

use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::cache::{CacheEntry, UnitCache, STAGE_EMIT, STAGE_TRANSFORM};
use crate::diagnostics::{Diagnostic, DiagnosticsAggregator, STAGE_TRANSFORM as DIAG_TRANSFORM};
use crate::program::{IncrementalProgramBuilder, ProgramError, ProgramHost};
use crate::resolution::ResourceResolutionLayer;
use crate::resource::{self, ResourceKind, ResourceOrigin, ResourceReference};
use crate::rewrite::PatternRewriteEngine;
use crate::worker::{
    PoolError, TransformFlags, TransformRequest, TransformTicket, TransformWorkerPool,
    TransformStrategies,
};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    /// Stable identifier combined into the cache key namespace.
    pub build_id: String,
    /// Rewrite external/inline component resources to virtual specifiers.
    pub jit_resources: bool,
    /// Run the pattern-rewrite optimization passes.
    pub optimize: bool,
    pub strip_source_maps: bool,
    /// Dispatch units containing native async syntax to the lowering step.
    pub lower_async: bool,
    /// Dispatch units to the component linking step.
    pub link_components: bool,
    pub host_has_info_sink: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            build_id: "lumen-build".to_string(),
            jit_resources: true,
            optimize: true,
            strip_source_maps: false,
            lower_async: false,
            link_components: false,
            host_has_info_sink: false,
        }
    }
}

impl BuildOptions {
    /// Opaque cache namespace: build id plus the serialized options. Any
    /// option change invalidates every per-unit key derived from it.
    pub fn cache_namespace(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        format!(
            "{}:{}",
            self.build_id,
            UnitCache::compute_fingerprint(serialized.as_bytes())
        )
    }
}

/// Fatal, build-aborting failures. Everything else is a diagnostic.
#[derive(Debug, Error)]
pub enum FatalBuildError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOURCE USAGE DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    static ref TEMPLATE_URL_RE: Regex = Regex::new(r#"\btemplateUrl\s*:\s*"([^"]+)""#).unwrap();
    static ref STYLE_URL_RE: Regex = Regex::new(r#"\bstyleUrl\s*:\s*"([^"]+)""#).unwrap();
    static ref STYLE_URLS_RE: Regex = Regex::new(r#"\bstyleUrls\s*:\s*\[([^\]]*)\]"#).unwrap();
    static ref INLINE_STYLES_RE: Regex =
        Regex::new(r#"\bstyles\s*:\s*\[(\s*"(?:[^"\\]|\\.)*"(?:\s*,\s*"(?:[^"\\]|\\.)*")*\s*,?\s*)\]"#)
            .unwrap();
    static ref QUOTED_RE: Regex = Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap();
}

/// Rewrite component resource usages in emitted code into addressable virtual
/// specifiers. Returns the rewritten code and the references it minted; the
/// references are consumed exactly once by the resolution layer.
pub fn encode_resource_usages(code: &str, importer: &str) -> (String, Vec<ResourceReference>) {
    let mut references = Vec::new();

    let code = TEMPLATE_URL_RE.replace_all(code, |caps: &Captures| {
        let reference = ResourceReference {
            kind: ResourceKind::Template,
            origin: ResourceOrigin::File {
                relative_path: caps[1].to_string(),
            },
        };
        let specifier = resource::encode(&reference);
        references.push(reference);
        format!("template: require(\"{}\")", specifier)
    });

    let code = STYLE_URL_RE.replace_all(&code, |caps: &Captures| {
        let reference = ResourceReference {
            kind: ResourceKind::Style,
            origin: ResourceOrigin::File {
                relative_path: caps[1].to_string(),
            },
        };
        let specifier = resource::encode(&reference);
        references.push(reference);
        format!("styles: [require(\"{}\")]", specifier)
    });

    let code = STYLE_URLS_RE.replace_all(&code, |caps: &Captures| {
        let mut requires = Vec::new();
        for url in QUOTED_RE.captures_iter(&caps[1]) {
            let reference = ResourceReference {
                kind: ResourceKind::Style,
                origin: ResourceOrigin::File {
                    relative_path: url[1].to_string(),
                },
            };
            let specifier = resource::encode(&reference);
            references.push(reference);
            requires.push(format!("require(\"{}\")", specifier));
        }
        format!("styles: [{}]", requires.join(", "))
    });

    let code = INLINE_STYLES_RE.replace_all(&code, |caps: &Captures| {
        let mut requires = Vec::new();
        for payload in QUOTED_RE.captures_iter(&caps[1]) {
            let reference = ResourceReference {
                kind: ResourceKind::Style,
                origin: ResourceOrigin::Inline {
                    importer: importer.to_string(),
                    data: payload[1].as_bytes().to_vec(),
                },
            };
            let specifier = resource::encode(&reference);
            references.push(reference);
            requires.push(format!("require(\"{}\")", specifier));
        }
        format!("styles: [{}]", requires.join(", "))
    });

    (code.into_owned(), references)
}

lazy_static! {
    static ref ASYNC_SYNTAX_RE: Regex = Regex::new(r"\basync\s+(function\b|\()|\bawait\b").unwrap();
}

/// Cheap structural pre-check for native async syntax. Over-approximates on
/// matching text inside strings or comments, which costs one worker round
/// trip, never correctness.
fn contains_native_async(code: &str) -> bool {
    ASYNC_SYNTAX_RE.is_match(code)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct BuildSummary {
    /// Final transformed code per unit path.
    pub outputs: HashMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
    /// True when any error diagnostic was produced. Output for unaffected
    /// units is still present.
    pub failed: bool,
}

pub struct BuildPipeline {
    builder: IncrementalProgramBuilder,
    cache: UnitCache,
    pool: TransformWorkerPool,
    resolution: ResourceResolutionLayer,
    options: BuildOptions,
}

impl BuildPipeline {
    pub fn new(host: Box<dyn ProgramHost>, options: BuildOptions) -> Result<Self, FatalBuildError> {
        Self::with_parts(
            IncrementalProgramBuilder::new(host),
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
            options,
        )
    }

    pub fn with_parts(
        builder: IncrementalProgramBuilder,
        engine: PatternRewriteEngine,
        strategies: TransformStrategies,
        options: BuildOptions,
    ) -> Result<Self, FatalBuildError> {
        let pool = TransformWorkerPool::new(engine, strategies)?;
        Ok(BuildPipeline {
            builder,
            cache: UnitCache::new(),
            pool,
            resolution: ResourceResolutionLayer::new(),
            options,
        })
    }

    pub fn resolution_layer(&mut self) -> &mut ResourceResolutionLayer {
        &mut self.resolution
    }

    pub fn cache(&self) -> &UnitCache {
        &self.cache
    }

    /// One build cycle. Only fatal failures return `Err`; everything else is
    /// aggregated into the summary's diagnostics.
    pub fn execute(&mut self, entry_units: &[String]) -> Result<BuildSummary, FatalBuildError> {
        let mut diagnostics = DiagnosticsAggregator::new(self.options.host_has_info_sink);
        let namespace = self.options.cache_namespace();

        let build = self.builder.build(entry_units, &mut self.cache)?;
        self.builder
            .gather_diagnostics(build.program, &build.affected, &mut diagnostics);

        // Stage keys are derived from unit content and the option namespace;
        // independent units fingerprint in parallel.
        let unit_fingerprints: Vec<(String, String)> = build
            .affected
            .iter()
            .map(|path| {
                let unit_fingerprint = self
                    .builder
                    .unit(path)
                    .map(|u| u.fingerprint.clone())
                    .unwrap_or_default();
                (path.clone(), unit_fingerprint)
            })
            .collect();
        let stage_keys: HashMap<String, String> = unit_fingerprints
            .into_par_iter()
            .map(|(path, unit_fingerprint)| {
                let key = UnitCache::compute_fingerprint(
                    format!("{}:{}:{}", namespace, path, unit_fingerprint).as_bytes(),
                );
                (path, key)
            })
            .collect();

        let mut outputs = HashMap::new();
        let mut tickets: Vec<(String, String, TransformTicket)> = Vec::new();

        for path in &build.affected {
            let stage_key = stage_keys.get(path).cloned().unwrap_or_default();

            if let Some(hit) = self.cache.get_if_current(STAGE_TRANSFORM, path, &stage_key) {
                outputs.insert(path.clone(), String::from_utf8_lossy(&hit.bytes).to_string());
                continue;
            }

            let emitted = match self.builder.emit(build.program, path) {
                Ok(emitted) => emitted,
                Err(e) => {
                    // Unit-scoped: record and keep building the rest.
                    diagnostics
                        .report(Diagnostic::error(DIAG_TRANSFORM, e.to_string()).with_file(path));
                    continue;
                }
            };

            self.cache.put(
                STAGE_EMIT,
                path,
                CacheEntry {
                    fingerprint: stage_key.clone(),
                    bytes: emitted.code.as_bytes().to_vec(),
                    source_map: emitted.source_map.clone(),
                },
            );

            let content = if self.options.jit_resources {
                let (rewritten, _references) = encode_resource_usages(&emitted.code, path);
                rewritten
            } else {
                emitted.code
            };

            let flags = TransformFlags {
                needs_linking: self.options.link_components,
                needs_async_lowering: self.options.lower_async && contains_native_async(&content),
                needs_optimization: self.options.optimize,
            };

            let ticket = self.pool.run(TransformRequest {
                path: path.clone(),
                content,
                flags,
                strip_source_maps: self.options.strip_source_maps,
            });
            tickets.push((path.clone(), stage_key, ticket));
        }

        // No mid-flight cancellation: a watch rebuild waits for these to
        // drain before the next cycle starts.
        for (path, stage_key, ticket) in tickets {
            match ticket.wait() {
                Ok(result) => {
                    diagnostics.report_all(result.diagnostics.clone());
                    self.cache.put(
                        STAGE_TRANSFORM,
                        &path,
                        CacheEntry {
                            fingerprint: stage_key,
                            bytes: result.content.as_bytes().to_vec(),
                            source_map: None,
                        },
                    );
                    outputs.insert(path, result.content);
                }
                Err(e) => {
                    diagnostics
                        .report(Diagnostic::error(DIAG_TRANSFORM, e.to_string()).with_file(&path));
                }
            }
        }

        let failed = diagnostics.has_errors();
        Ok(BuildSummary {
            outputs,
            diagnostics: diagnostics.merged(),
            failed,
        })
    }
}
