//! Transform Worker Pool Tests
//!
//! Exercises failure isolation, the flagless fast path, and the dependency
//! scan through the public pool surface.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::rewrite::PatternRewriteEngine;
    use crate::worker::{
        strip_source_map_comments, TransformError, TransformFlags, TransformRequest,
        TransformStrategies, TransformTicket, TransformWorkerPool, UnitTransform,
    };

    /// Linker stand-in that panics on one path and uppercases the rest.
    struct FaultyLinker;

    impl UnitTransform for FaultyLinker {
        fn name(&self) -> &'static str {
            "faulty-linker"
        }

        fn apply(&self, path: &str, content: &str) -> Result<Option<String>, String> {
            if path.contains("boom") {
                panic!("linker exploded on {}", path);
            }
            Ok(Some(content.to_uppercase()))
        }
    }

    fn faulty_pool(size: usize) -> TransformWorkerPool {
        let strategies = TransformStrategies {
            linker: Arc::new(FaultyLinker),
            ..TransformStrategies::default()
        };
        TransformWorkerPool::with_size(size, PatternRewriteEngine::new(), strategies)
            .expect("pool spawn")
    }

    fn linking_request(path: &str, content: &str) -> TransformRequest {
        TransformRequest {
            path: path.to_string(),
            content: content.to_string(),
            flags: TransformFlags {
                needs_linking: true,
                ..TransformFlags::default()
            },
            strip_source_maps: false,
        }
    }

    #[test]
    fn test_panic_fails_only_the_owning_request() {
        let pool = faulty_pool(2);

        let good_a = pool.run(linking_request("/a.lum", "var a = 1;"));
        let boom = pool.run(linking_request("/boom.lum", "var b = 2;"));
        let good_c = pool.run(linking_request("/c.lum", "var c = 3;"));

        assert_eq!(good_a.wait().expect("a completes").content, "VAR A = 1;");
        match boom.wait() {
            Err(TransformError::WorkerPanic { path, message }) => {
                assert_eq!(path, "/boom.lum");
                assert!(message.contains("linker exploded"));
            }
            other => panic!("expected a worker panic, got {:?}", other.map(|r| r.content)),
        }
        assert_eq!(good_c.wait().expect("c completes").content, "VAR C = 3;");

        // The pool stays usable after the panic.
        let after = pool.run(linking_request("/d.lum", "var d = 4;"));
        assert_eq!(after.wait().expect("d completes").content, "VAR D = 4;");
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_flagless_requests_take_the_fast_path() {
        let pool = faulty_pool(1);
        let content = "var untouched = compose(a, b);\n";
        let ticket = pool.run(TransformRequest {
            path: "/plain.lum".to_string(),
            content: content.to_string(),
            flags: TransformFlags::default(),
            strip_source_maps: false,
        });

        assert!(matches!(&ticket, TransformTicket::Completed(_)));
        let result = ticket.wait().expect("fast path");
        assert_eq!(result.content, content);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_fast_path_matches_worker_output_for_inert_content() {
        let pool = TransformWorkerPool::with_size(
            1,
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
        )
        .expect("pool spawn");

        // Nothing for the optimization passes to match, so both routes must
        // hand back the same bytes.
        let content = "let total = 1 + 2;\n";
        let fast = pool
            .run(TransformRequest {
                path: "/u.lum".to_string(),
                content: content.to_string(),
                flags: TransformFlags::default(),
                strip_source_maps: false,
            })
            .wait()
            .expect("fast");
        let slow = pool
            .run(TransformRequest {
                path: "/u.lum".to_string(),
                content: content.to_string(),
                flags: TransformFlags {
                    needs_optimization: true,
                    ..TransformFlags::default()
                },
                strip_source_maps: false,
            })
            .wait()
            .expect("slow");

        assert_eq!(fast.content, slow.content);
    }

    #[test]
    fn test_optimization_runs_on_worker_path() {
        let pool = TransformWorkerPool::with_size(
            1,
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
        )
        .expect("pool spawn");

        let result = pool
            .run(TransformRequest {
                path: "/w.lum".to_string(),
                content: "var widget = createWidget();\n".to_string(),
                flags: TransformFlags {
                    needs_optimization: true,
                    ..TransformFlags::default()
                },
                strip_source_maps: false,
            })
            .wait()
            .expect("transform");
        assert!(result.content.contains("/*@__PURE__*/ createWidget()"));
    }

    #[test]
    fn test_unparseable_unit_degrades_to_a_warning() {
        let pool = TransformWorkerPool::with_size(
            1,
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
        )
        .expect("pool spawn");

        let content = "var = = broken(;";
        let result = pool
            .run(TransformRequest {
                path: "/broken.lum".to_string(),
                content: content.to_string(),
                flags: TransformFlags {
                    needs_optimization: true,
                    ..TransformFlags::default()
                },
                strip_source_maps: false,
            })
            .wait()
            .expect("request still completes");

        assert_eq!(result.content, content);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].file.as_deref(), Some("/broken.lum"));
    }

    #[test]
    fn test_source_map_comments_are_stripped() {
        let pool = TransformWorkerPool::with_size(
            1,
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
        )
        .expect("pool spawn");

        let content = "var a = 1;\n//# sourceMappingURL=a.js.map\nvar b = 2;\n";
        let result = pool
            .run(TransformRequest {
                path: "/m.lum".to_string(),
                content: content.to_string(),
                flags: TransformFlags::default(),
                strip_source_maps: true,
            })
            .wait()
            .expect("transform");
        assert_eq!(result.content, "var a = 1;\nvar b = 2;\n");
    }

    #[test]
    fn test_strip_handles_both_comment_spellings() {
        let content = "//@ sourceMappingURL=old.map\n//# sourceMappingURL=new.map\nbody();\n";
        assert_eq!(strip_source_map_comments(content), "body();\n");
    }

    #[test]
    fn test_resource_dependencies_are_collected() {
        let pool = TransformWorkerPool::with_size(
            1,
            PatternRewriteEngine::new(),
            TransformStrategies::default(),
        )
        .expect("pool spawn");

        let content = concat!(
            "template: require(\"lumen-resource:template;file:./b.html\");\n",
            "styles: [require(\"lumen-resource:style;file:./a.css\"), ",
            "require(\"lumen-resource:style;file:./a.css\")];\n",
        );
        let result = pool
            .run(TransformRequest {
                path: "/deps.lum".to_string(),
                content: content.to_string(),
                flags: TransformFlags::default(),
                strip_source_maps: false,
            })
            .wait()
            .expect("fast path");

        assert_eq!(
            result.dependencies,
            vec![
                "lumen-resource:style;file:./a.css".to_string(),
                "lumen-resource:template;file:./b.html".to_string(),
            ]
        );
    }
}
