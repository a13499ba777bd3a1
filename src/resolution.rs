//! Resource Resolution Layer for Lumen Build
//!
//! Bundler plugin hooks that turn the virtual resource specifiers emitted by
//! the compile phase back into real content. `resolve` decodes a specifier
//! into a synthetic module path under our namespace; `load` produces the
//! resource itself. Specifiers we do not own resolve to `None` and pass
//! through to whatever layer owns them.
//!
//! File-origin styles are deliberately not read here: the downstream
//! stylesheet pipeline re-reads the file itself, so the load hook only hands
//! back the resolved path. Templates are always read eagerly. File-origin
//! resources are registered as watch dependencies for rebuilds.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::{CachedLoad, UnitCache};
use crate::diagnostics::{Diagnostic, STAGE_TRANSFORM};
use crate::resource::{self, ResourceKind, ResourceOrigin, ResourceReference};

/// Namespace claimed by this layer in the surrounding bundler's build graph.
pub const RESOLUTION_NAMESPACE: &str = "lumen-resource";

// ═══════════════════════════════════════════════════════════════════════════════
// HOOK TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedResource {
    pub path: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderHint {
    Css,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedResource {
    /// `None` defers reading to the downstream processor (file-origin styles).
    pub contents: Option<String>,
    pub loader: LoaderHint,
}

#[derive(Debug)]
struct PendingResource {
    reference: ResourceReference,
    importer: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAYER
// ═══════════════════════════════════════════════════════════════════════════════

type FileReader = Box<dyn Fn(&Path) -> std::io::Result<String>>;

pub struct ResourceResolutionLayer {
    /// synthetic path -> decoded reference, populated by resolve, consumed by
    /// load. References are never persisted across builds.
    pending: HashMap<String, PendingResource>,
    watch_files: HashSet<PathBuf>,
    reader: FileReader,
    inline_counter: u64,
}

impl Default for ResourceResolutionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceResolutionLayer {
    pub fn new() -> Self {
        Self::with_reader(Box::new(|path| fs::read_to_string(path)))
    }

    pub fn with_reader(reader: FileReader) -> Self {
        ResourceResolutionLayer {
            pending: HashMap::new(),
            watch_files: HashSet::new(),
            reader,
            inline_counter: 0,
        }
    }

    /// Resolve hook. `None` means the specifier is not ours; the bundler keeps
    /// asking other layers.
    pub fn resolve(&mut self, specifier: &str, importer: Option<&str>) -> Option<ResolvedResource> {
        let reference = resource::decode(specifier)?;

        let (synthetic, importer) = match &reference.origin {
            ResourceOrigin::File { relative_path } => {
                let importer = importer.unwrap_or_default().to_string();
                let resolved = join_relative(&importer, relative_path);
                (resolved, importer)
            }
            ResourceOrigin::Inline { importer, .. } => {
                self.inline_counter += 1;
                let synthetic = format!(
                    "{}?inline-{}-{}",
                    importer,
                    reference.kind.as_str(),
                    self.inline_counter
                );
                (synthetic, importer.clone())
            }
        };

        self.pending.insert(
            synthetic.clone(),
            PendingResource {
                reference,
                importer,
            },
        );
        Some(ResolvedResource {
            path: synthetic,
            namespace: RESOLUTION_NAMESPACE.to_string(),
        })
    }

    /// Load hook for synthetic paths in our namespace. Failures surface as
    /// error diagnostics attributed to the importing unit.
    pub fn load(
        &mut self,
        synthetic_path: &str,
        cache: &mut UnitCache,
    ) -> Result<LoadedResource, Diagnostic> {
        let pending = match self.pending.remove(synthetic_path) {
            Some(pending) => pending,
            None => {
                return Err(Diagnostic::error(
                    STAGE_TRANSFORM,
                    format!("no pending resource for {}", synthetic_path),
                ));
            }
        };

        if let Some(cached) = cache.get_load(synthetic_path) {
            return Ok(LoadedResource {
                contents: cached.contents.clone(),
                loader: loader_for(pending.reference.kind),
            });
        }

        let contents = match (&pending.reference.kind, &pending.reference.origin) {
            // Stylesheet pipeline re-reads the file itself; we only resolve.
            (ResourceKind::Style, ResourceOrigin::File { .. }) => {
                self.watch_files.insert(PathBuf::from(synthetic_path));
                None
            }
            (ResourceKind::Template, ResourceOrigin::File { .. }) => {
                self.watch_files.insert(PathBuf::from(synthetic_path));
                match (self.reader)(Path::new(synthetic_path)) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        return Err(Diagnostic::error(
                            STAGE_TRANSFORM,
                            format!("failed to read template {}: {}", synthetic_path, e),
                        )
                        .with_file(&pending.importer));
                    }
                }
            }
            (_, ResourceOrigin::Inline { data, .. }) => match String::from_utf8(data.clone()) {
                Ok(text) => Some(text),
                Err(_) => {
                    return Err(Diagnostic::error(
                        STAGE_TRANSFORM,
                        format!("inline resource is not valid UTF-8: {}", synthetic_path),
                    )
                    .with_file(&pending.importer));
                }
            },
        };

        cache.put_load(
            synthetic_path,
            CachedLoad {
                importer: pending.importer.clone(),
                contents: contents.clone(),
            },
        );

        Ok(LoadedResource {
            contents,
            loader: loader_for(pending.reference.kind),
        })
    }

    /// Files to register with the host's watcher for rebuild invalidation.
    pub fn watch_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.watch_files.iter()
    }
}

fn loader_for(kind: ResourceKind) -> LoaderHint {
    match kind {
        ResourceKind::Style => LoaderHint::Css,
        ResourceKind::Template => LoaderHint::Text,
    }
}

/// Resolve a specifier path relative to its importer's directory.
fn join_relative(importer: &str, relative: &str) -> String {
    let base = Path::new(importer)
        .parent()
        .unwrap_or_else(|| Path::new(""));
    let mut parts: Vec<String> = base
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    let joined = parts.join("/");
    // Collapse the doubled separator a root component leaves behind.
    if joined.starts_with("//") {
        joined[1..].to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::encode;

    fn file_specifier(kind: ResourceKind, relative: &str) -> String {
        encode(&ResourceReference {
            kind,
            origin: ResourceOrigin::File {
                relative_path: relative.to_string(),
            },
        })
    }

    fn inline_specifier(kind: ResourceKind, importer: &str, data: &[u8]) -> String {
        encode(&ResourceReference {
            kind,
            origin: ResourceOrigin::Inline {
                importer: importer.to_string(),
                data: data.to_vec(),
            },
        })
    }

    #[test]
    fn test_foreign_specifiers_pass_through() {
        let mut layer = ResourceResolutionLayer::new();
        assert!(layer.resolve("./app.js", Some("/src/main.lum")).is_none());
        assert!(layer
            .resolve("other-ns:style;file:./x.css", Some("/src/main.lum"))
            .is_none());
    }

    #[test]
    fn test_file_style_resolves_and_defers_read() {
        let mut layer = ResourceResolutionLayer::with_reader(Box::new(|_| {
            panic!("style loads must not read the file")
        }));
        let mut cache = UnitCache::new();

        let resolved = layer
            .resolve(
                &file_specifier(ResourceKind::Style, "./button.css"),
                Some("/src/app/button.lum"),
            )
            .expect("own specifier");
        assert_eq!(resolved.namespace, RESOLUTION_NAMESPACE);
        assert_eq!(resolved.path, "/src/app/button.css");

        let loaded = layer.load(&resolved.path, &mut cache).expect("load");
        assert_eq!(loaded.loader, LoaderHint::Css);
        assert_eq!(loaded.contents, None);
        assert!(layer.watch_files().any(|p| p.ends_with("button.css")));
    }

    #[test]
    fn test_file_template_reads_eagerly() {
        let mut layer = ResourceResolutionLayer::with_reader(Box::new(|path| {
            assert_eq!(path, Path::new("/src/app/card.html"));
            Ok("<div>card</div>".to_string())
        }));
        let mut cache = UnitCache::new();

        let resolved = layer
            .resolve(
                &file_specifier(ResourceKind::Template, "./card.html"),
                Some("/src/app/card.lum"),
            )
            .expect("own specifier");
        let loaded = layer.load(&resolved.path, &mut cache).expect("load");
        assert_eq!(loaded.loader, LoaderHint::Text);
        assert_eq!(loaded.contents.as_deref(), Some("<div>card</div>"));
    }

    #[test]
    fn test_missing_template_is_a_diagnostic_for_the_importer() {
        let mut layer = ResourceResolutionLayer::with_reader(Box::new(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file",
            ))
        }));
        let mut cache = UnitCache::new();

        let resolved = layer
            .resolve(
                &file_specifier(ResourceKind::Template, "./missing.html"),
                Some("/src/app/card.lum"),
            )
            .expect("own specifier");
        let err = layer.load(&resolved.path, &mut cache).unwrap_err();
        assert_eq!(err.file.as_deref(), Some("/src/app/card.lum"));
    }

    #[test]
    fn test_inline_style_decodes_payload() {
        let mut layer = ResourceResolutionLayer::new();
        let mut cache = UnitCache::new();

        let resolved = layer
            .resolve(
                &inline_specifier(ResourceKind::Style, "/src/app/button.lum", b".btn{}"),
                Some("/src/app/button.lum"),
            )
            .expect("own specifier");
        assert!(resolved.path.starts_with("/src/app/button.lum?inline-style-"));

        let loaded = layer.load(&resolved.path, &mut cache).expect("load");
        assert_eq!(loaded.contents.as_deref(), Some(".btn{}"));
        assert_eq!(loaded.loader, LoaderHint::Css);
    }

    #[test]
    fn test_parent_relative_paths() {
        let mut layer = ResourceResolutionLayer::new();
        let resolved = layer
            .resolve(
                &file_specifier(ResourceKind::Style, "../shared/theme.css"),
                Some("/src/app/button.lum"),
            )
            .expect("own specifier");
        assert_eq!(resolved.path, "/src/shared/theme.css");
    }
}
