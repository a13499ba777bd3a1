//! Resource Reference Codec for Lumen Build
//!
//! Component templates and stylesheets are addressed during the build through
//! virtual specifier strings instead of real filesystem paths. The codec here
//! owns that grammar:
//!
//! ```text
//! lumen-resource:<kind>;<tag>:<payload>
//!   kind ∈ { style, template }
//!   tag  ∈ { file, inline }
//!   file payload   = path relative to the importer
//!   inline payload = <importer-relative-path>;<base64 data>
//! ```
//!
//! Decoding is pattern-matched, not parsed generically. Anything that does not
//! carry our scheme prefix decodes to `None` so that unrelated resolution
//! layers in the same build graph can own their own specifiers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Scheme prefix identifying specifiers owned by this resolution layer.
pub const RESOURCE_SCHEME: &str = "lumen-resource";

// ═══════════════════════════════════════════════════════════════════════════════
// REFERENCE MODEL
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Style,
    Template,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Style => "style",
            ResourceKind::Template => "template",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "style" => Some(ResourceKind::Style),
            "template" => Some(ResourceKind::Template),
            _ => None,
        }
    }
}

/// Where the resource payload lives. `File` origins are re-read from disk each
/// build; `Inline` origins carry their content with the specifier itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "origin")]
pub enum ResourceOrigin {
    File {
        /// Path relative to the importing unit.
        relative_path: String,
    },
    Inline {
        /// The importing unit, kept so diagnostics and synthetic module paths
        /// can be attributed to a real file.
        importer: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub origin: ResourceOrigin,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CODEC
// ═══════════════════════════════════════════════════════════════════════════════

pub fn encode(reference: &ResourceReference) -> String {
    match &reference.origin {
        ResourceOrigin::File { relative_path } => format!(
            "{}:{};file:{}",
            RESOURCE_SCHEME,
            reference.kind.as_str(),
            relative_path
        ),
        ResourceOrigin::Inline { importer, data } => format!(
            "{}:{};inline:{};{}",
            RESOURCE_SCHEME,
            reference.kind.as_str(),
            importer,
            BASE64.encode(data)
        ),
    }
}

/// Decode a specifier we may or may not own. `None` means "not ours" or
/// malformed; callers ignore such specifiers rather than erroring, so foreign
/// virtual modules pass through untouched.
pub fn decode(specifier: &str) -> Option<ResourceReference> {
    let rest = specifier.strip_prefix(RESOURCE_SCHEME)?.strip_prefix(':')?;
    let (kind_tag, rest) = rest.split_once(';')?;
    let kind = ResourceKind::from_tag(kind_tag)?;
    let (origin_tag, payload) = rest.split_once(':')?;

    match origin_tag {
        "file" => {
            if payload.is_empty() {
                return None;
            }
            Some(ResourceReference {
                kind,
                origin: ResourceOrigin::File {
                    relative_path: payload.to_string(),
                },
            })
        }
        "inline" => {
            let (importer, encoded) = payload.split_once(';')?;
            if importer.is_empty() {
                return None;
            }
            let data = BASE64.decode(encoded).ok()?;
            Some(ResourceReference {
                kind,
                origin: ResourceOrigin::Inline {
                    importer: importer.to_string(),
                    data,
                },
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_ref(kind: ResourceKind, path: &str) -> ResourceReference {
        ResourceReference {
            kind,
            origin: ResourceOrigin::File {
                relative_path: path.to_string(),
            },
        }
    }

    fn inline_ref(kind: ResourceKind, importer: &str, data: &[u8]) -> ResourceReference {
        ResourceReference {
            kind,
            origin: ResourceOrigin::Inline {
                importer: importer.to_string(),
                data: data.to_vec(),
            },
        }
    }

    #[test]
    fn test_round_trip_all_shapes() {
        let refs = vec![
            file_ref(ResourceKind::Style, "./button.css"),
            file_ref(ResourceKind::Template, "../shared/card.html"),
            inline_ref(ResourceKind::Style, "/app/button.lum", b".btn { color: red; }"),
            inline_ref(ResourceKind::Template, "/app/card.lum", b"<div>{{ title }}</div>"),
        ];
        for reference in refs {
            let specifier = encode(&reference);
            let decoded = decode(&specifier).expect("own specifier must decode");
            assert_eq!(decoded, reference, "round trip for {}", specifier);
        }
    }

    #[test]
    fn test_foreign_scheme_is_ignored() {
        assert_eq!(decode("other-plugin:style;file:./a.css"), None);
        assert_eq!(decode("./plain/relative/import.js"), None);
        assert_eq!(decode("\0rollup-virtual:thing"), None);
    }

    #[test]
    fn test_malformed_payload_is_ignored() {
        // Unknown kind and origin tags
        assert_eq!(decode("lumen-resource:script;file:./a.js"), None);
        assert_eq!(decode("lumen-resource:style;url:./a.css"), None);
        // Missing pieces
        assert_eq!(decode("lumen-resource:style"), None);
        assert_eq!(decode("lumen-resource:style;file:"), None);
        // Inline payload with invalid base64
        assert_eq!(decode("lumen-resource:style;inline:/a.lum;@@@"), None);
    }

    #[test]
    fn test_inline_base64_payload() {
        let reference = inline_ref(ResourceKind::Style, "/a.lum", b"p{}");
        let specifier = encode(&reference);
        assert!(specifier.starts_with("lumen-resource:style;inline:/a.lum;"));
        assert!(!specifier.contains("p{}"), "payload must be encoded");
    }
}
