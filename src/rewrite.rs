//! Pattern Rewrite Engine for Lumen Build
//!
//! Structural rewrite passes over already-emitted JavaScript. Each pass parses
//! the unit with oxc, matches one exact statement shape, and splices the source
//! text by span offsets. A pass that is not 100% certain of a match declines
//! and leaves the unit byte-identical; declining is an `Ok(Unchanged)`, never
//! an error. Every pass is idempotent on its own output.
//!
//! Passes:
//! 1. Pure annotation: prepend `/*@__PURE__*/` to top-level `new`/call
//!    expressions so downstream bundlers can eliminate unused results.
//! 2. Enumerated-constant lowering: fold the two-statement enum emit shape
//!    into a single pure-marked self-invoking initializer.
//! 3. Metadata elision: drop side-effect-free calls to the debug-only
//!    component metadata registration function.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, AssignmentTarget, BindingPattern, Expression, Program, Statement,
    VariableDeclarationKind,
};
use oxc_parser::Parser;
use oxc_span::SourceType;
use oxc_syntax::operator::{AssignmentOperator, BinaryOperator, LogicalOperator, UnaryOperator};
use std::collections::HashSet;
use thiserror::Error;

/// Marker honored by downstream dead-code elimination.
pub const PURE_MARKER: &str = "/*@__PURE__*/";

/// Alternate spelling some minifiers emit; treated as already-annotated.
const PURE_MARKER_HASH: &str = "/*#__PURE__*/";

/// Callees that are never safe to mark pure or reorder. Matched against the
/// dotted callee name and against its root identifier.
const SIDE_EFFECT_CALLEES: &[&str] = &[
    "require",
    "eval",
    "console",
    "document",
    "window",
    "globalThis",
    "Object.defineProperty",
    "Object.assign",
    "Object.freeze",
];

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOME TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// A pass either rewrote the unit or declined. Declining is the normal case
/// for units that do not contain the matched shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Changed(String),
    Unchanged,
}

impl RewriteOutcome {
    pub fn into_text(self, original: &str) -> String {
        match self {
            RewriteOutcome::Changed(text) => text,
            RewriteOutcome::Unchanged => original.to_string(),
        }
    }
}

/// Unrecoverable pass failure, distinct from a declined match.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("unit is not parseable JavaScript: {0}")]
    Parse(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PatternRewriteEngine {
    /// Name of the metadata-registration function the elision pass removes.
    metadata_fn: String,
    /// Extra side-effectful callees on top of the built-in deny list.
    side_effect_callees: HashSet<String>,
}

impl Default for PatternRewriteEngine {
    fn default() -> Self {
        PatternRewriteEngine {
            metadata_fn: "setComponentMetadata".to_string(),
            side_effect_callees: HashSet::new(),
        }
    }
}

impl PatternRewriteEngine {
    pub fn new() -> Self {
        PatternRewriteEngine::default()
    }

    pub fn with_metadata_fn(mut self, name: &str) -> Self {
        self.metadata_fn = name.to_string();
        self
    }

    pub fn with_side_effect_callee(mut self, name: &str) -> Self {
        self.side_effect_callees.insert(name.to_string());
        self
    }

    /// Run every pass in order. Metadata elision first (fewer statements for
    /// the later passes to scan), then enum lowering, then pure annotation.
    pub fn apply_all(&self, source: &str) -> Result<RewriteOutcome, RewriteError> {
        let mut text = source.to_string();
        let mut changed = false;

        let passes: [fn(&Self, &str) -> Result<RewriteOutcome, RewriteError>; 3] = [
            Self::elide_metadata,
            Self::lower_enum_constants,
            Self::annotate_pure,
        ];
        for pass in passes {
            if let RewriteOutcome::Changed(next) = pass(self, &text)? {
                text = next;
                changed = true;
            }
        }

        if changed {
            Ok(RewriteOutcome::Changed(text))
        } else {
            Ok(RewriteOutcome::Unchanged)
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PASS 1: PURE ANNOTATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Prepend the pure marker to top-level `new`/call expressions (bare
    /// expression statements and variable initializers). Skips callees that
    /// are statically known to have side effects and expressions already
    /// carrying a marker.
    pub fn annotate_pure(&self, source: &str) -> Result<RewriteOutcome, RewriteError> {
        let allocator = Allocator::default();
        let program = parse_program(&allocator, source)?;

        let mut offsets: Vec<u32> = Vec::new();
        for stmt in &program.body {
            match stmt {
                Statement::ExpressionStatement(es) => {
                    self.consider_pure_target(&es.expression, source, &mut offsets);
                }
                Statement::VariableDeclaration(var) => {
                    for decl in &var.declarations {
                        if let Some(init) = &decl.init {
                            self.consider_pure_target(init, source, &mut offsets);
                        }
                    }
                }
                Statement::ExportNamedDeclaration(export) => {
                    if let Some(oxc_ast::ast::Declaration::VariableDeclaration(var)) =
                        &export.declaration
                    {
                        for decl in &var.declarations {
                            if let Some(init) = &decl.init {
                                self.consider_pure_target(init, source, &mut offsets);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if offsets.is_empty() {
            return Ok(RewriteOutcome::Unchanged);
        }

        let replacements = offsets
            .into_iter()
            .map(|at| (at, at, format!("{} ", PURE_MARKER)))
            .collect();
        Ok(RewriteOutcome::Changed(apply_replacements(
            source,
            replacements,
        )))
    }

    fn consider_pure_target(&self, expr: &Expression, source: &str, offsets: &mut Vec<u32>) {
        let inner = unwrap_parens(expr);
        let (callee, at) = match inner {
            Expression::CallExpression(call) => (&call.callee, call.span.start),
            Expression::NewExpression(new_expr) => (&new_expr.callee, new_expr.span.start),
            _ => return,
        };
        // Only annotate callees we can name; a computed or otherwise opaque
        // callee is not provably side-effect-free.
        let Some(name) = dotted_callee_name(callee) else {
            return;
        };
        if self.callee_has_side_effects(&name) {
            return;
        }
        if preceded_by_pure_marker(source, at as usize) {
            return;
        }
        offsets.push(at);
    }

    fn callee_has_side_effects(&self, dotted: &str) -> bool {
        let root = dotted.split('.').next().unwrap_or(dotted);
        SIDE_EFFECT_CALLEES.contains(&dotted)
            || SIDE_EFFECT_CALLEES.contains(&root)
            || self.side_effect_callees.contains(dotted)
            || self.side_effect_callees.contains(root)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PASS 2: ENUMERATED-CONSTANT LOWERING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Match the two-statement enum emit shape:
    ///
    /// ```text
    /// var Color;
    /// (function (Color) {
    ///     Color[Color["Red"] = 0] = "Red";
    /// })(Color || (Color = {}));
    /// ```
    ///
    /// and fold it into a pure-marked self-invoking initializer that
    /// re-establishes `Color = Color || {}`, re-creates the assignments, and
    /// returns the enum object. Any impure assigned value aborts the pass for
    /// the whole unit; zero assignments leave the candidate untouched.
    pub fn lower_enum_constants(&self, source: &str) -> Result<RewriteOutcome, RewriteError> {
        let allocator = Allocator::default();
        let program = parse_program(&allocator, source)?;

        let mut replacements: Vec<(u32, u32, String)> = Vec::new();
        let body = &program.body;
        let mut i = 0;
        while body.len() >= 2 && i < body.len() - 1 {
            match self.match_enum_candidate(&body[i], &body[i + 1], source) {
                EnumMatch::Rewrite(replacement) => {
                    replacements.push(replacement);
                    i += 2;
                }
                EnumMatch::ImpureValue => {
                    // Purity guard: never partial-apply; the unit passes
                    // through byte-identical.
                    return Ok(RewriteOutcome::Unchanged);
                }
                EnumMatch::NoMatch => {
                    i += 1;
                }
            }
        }

        if replacements.is_empty() {
            return Ok(RewriteOutcome::Unchanged);
        }
        Ok(RewriteOutcome::Changed(apply_replacements(
            source,
            replacements,
        )))
    }

    fn match_enum_candidate(
        &self,
        decl_stmt: &Statement,
        call_stmt: &Statement,
        source: &str,
    ) -> EnumMatch {
        // Statement 1: `var X;` — single declarator, no initializer.
        let Statement::VariableDeclaration(var) = decl_stmt else {
            return EnumMatch::NoMatch;
        };
        if var.kind != VariableDeclarationKind::Var || var.declarations.len() != 1 {
            return EnumMatch::NoMatch;
        }
        let declarator = &var.declarations[0];
        if declarator.init.is_some() {
            return EnumMatch::NoMatch;
        }
        let BindingPattern::BindingIdentifier(enum_name) = &declarator.id else {
            return EnumMatch::NoMatch;
        };
        let enum_name = enum_name.name.as_str();

        // Statement 2: bare call of a single-parameter function expression.
        let Statement::ExpressionStatement(es) = call_stmt else {
            return EnumMatch::NoMatch;
        };
        let Expression::CallExpression(call) = unwrap_parens(&es.expression) else {
            return EnumMatch::NoMatch;
        };
        let Expression::FunctionExpression(func) = unwrap_parens(&call.callee) else {
            return EnumMatch::NoMatch;
        };
        if func.params.items.len() != 1 || func.params.rest.is_some() {
            return EnumMatch::NoMatch;
        }
        let BindingPattern::BindingIdentifier(param) = &func.params.items[0].pattern else {
            return EnumMatch::NoMatch;
        };
        // The synthesized body reuses the assignment text verbatim, which is
        // only sound when the parameter shadows the enum variable by name.
        if param.name.as_str() != enum_name {
            return EnumMatch::NoMatch;
        }

        // Argument must be the merge shape for this exact variable.
        if call.arguments.len() != 1 {
            return EnumMatch::NoMatch;
        }
        let Some(argument) = call.arguments[0].as_expression() else {
            return EnumMatch::NoMatch;
        };
        if !is_enum_merge_argument(unwrap_parens(argument), enum_name) {
            return EnumMatch::NoMatch;
        }

        // Body: only pure member assignments into the parameter.
        let Some(func_body) = &func.body else {
            return EnumMatch::NoMatch;
        };
        if func_body.statements.is_empty() {
            // Nothing to wrap.
            return EnumMatch::NoMatch;
        }
        let mut assignment_texts: Vec<&str> = Vec::new();
        for stmt in &func_body.statements {
            let Statement::ExpressionStatement(member_stmt) = stmt else {
                return EnumMatch::NoMatch;
            };
            let Expression::AssignmentExpression(assignment) =
                unwrap_parens(&member_stmt.expression)
            else {
                return EnumMatch::NoMatch;
            };
            match check_enum_assignment(assignment, enum_name) {
                AssignmentCheck::Pure => {
                    let span = member_stmt.span;
                    assignment_texts.push(&source[span.start as usize..span.end as usize]);
                }
                AssignmentCheck::WrongShape => return EnumMatch::NoMatch,
                AssignmentCheck::Impure => return EnumMatch::ImpureValue,
            }
        }

        let mut body_text = String::new();
        for text in &assignment_texts {
            body_text.push_str("    ");
            body_text.push_str(text.trim_end_matches(';'));
            body_text.push_str(";\n");
        }
        let replacement = format!(
            "var {name} = {marker} (function () {{\n    {name} = {name} || {{}};\n{body}    return {name};\n}})();",
            name = enum_name,
            marker = PURE_MARKER,
            body = body_text,
        );

        EnumMatch::Rewrite((var.span.start, es.span.end, replacement))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PASS 3: METADATA ELISION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Remove top-level calls to the metadata-registration function. The call
    /// is registration-only, so removal cannot change behavior as long as the
    /// arguments themselves are side-effect-free. Also matches the dev-mode
    /// guarded forms `guard && setComponentMetadata(...)` and
    /// `guard ? setComponentMetadata(...) : fallback`.
    pub fn elide_metadata(&self, source: &str) -> Result<RewriteOutcome, RewriteError> {
        let allocator = Allocator::default();
        let program = parse_program(&allocator, source)?;

        let mut replacements: Vec<(u32, u32, String)> = Vec::new();
        for stmt in &program.body {
            let Statement::ExpressionStatement(es) = stmt else {
                continue;
            };
            if !self.is_elidable_metadata_expression(unwrap_parens(&es.expression)) {
                continue;
            }
            let end = consume_statement_tail(source, es.span.end as usize);
            replacements.push((es.span.start, end as u32, String::new()));
        }

        if replacements.is_empty() {
            return Ok(RewriteOutcome::Unchanged);
        }
        Ok(RewriteOutcome::Changed(apply_replacements(
            source,
            replacements,
        )))
    }

    fn is_elidable_metadata_expression(&self, expr: &Expression) -> bool {
        match expr {
            Expression::CallExpression(call) => {
                dotted_callee_name(&call.callee).as_deref() == Some(self.metadata_fn.as_str())
                    && call
                        .arguments
                        .iter()
                        .all(|arg| argument_is_side_effect_free(arg))
            }
            Expression::LogicalExpression(logical)
                if logical.operator == LogicalOperator::And =>
            {
                is_pure_expression(&logical.left, true)
                    && self.is_elidable_metadata_expression(unwrap_parens(&logical.right))
            }
            Expression::ConditionalExpression(cond) => {
                is_pure_expression(&cond.test, true)
                    && self.is_elidable_metadata_expression(unwrap_parens(&cond.consequent))
                    && is_pure_expression(&cond.alternate, true)
            }
            _ => false,
        }
    }
}

enum EnumMatch {
    Rewrite((u32, u32, String)),
    ImpureValue,
    NoMatch,
}

enum AssignmentCheck {
    Pure,
    WrongShape,
    Impure,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHAPE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_program<'a>(
    allocator: &'a Allocator,
    source: &'a str,
) -> Result<Program<'a>, RewriteError> {
    let source_type = SourceType::default().with_module(true);
    let ret = Parser::new(allocator, source, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        let first = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser panicked".to_string());
        return Err(RewriteError::Parse(first));
    }
    Ok(ret.program)
}

fn unwrap_parens<'a, 'b>(expr: &'b Expression<'a>) -> &'b Expression<'a> {
    let mut current = expr;
    while let Expression::ParenthesizedExpression(paren) = current {
        current = &paren.expression;
    }
    current
}

/// `X || (X = {})` or `X = X || {}`, for the given variable name.
fn is_enum_merge_argument(expr: &Expression, name: &str) -> bool {
    match expr {
        Expression::LogicalExpression(logical) if logical.operator == LogicalOperator::Or => {
            let left_is_var = matches!(
                unwrap_parens(&logical.left),
                Expression::Identifier(ident) if ident.name.as_str() == name
            );
            let right_is_init = match unwrap_parens(&logical.right) {
                Expression::AssignmentExpression(assign) => {
                    assign.operator == AssignmentOperator::Assign
                        && matches!(
                            &assign.left,
                            AssignmentTarget::AssignmentTargetIdentifier(target)
                                if target.name.as_str() == name
                        )
                        && matches!(
                            unwrap_parens(&assign.right),
                            Expression::ObjectExpression(obj) if obj.properties.is_empty()
                        )
                }
                _ => false,
            };
            left_is_var && right_is_init
        }
        Expression::AssignmentExpression(assign) => {
            assign.operator == AssignmentOperator::Assign
                && matches!(
                    &assign.left,
                    AssignmentTarget::AssignmentTargetIdentifier(target)
                        if target.name.as_str() == name
                )
                && is_enum_merge_argument(unwrap_parens(&assign.right), name)
        }
        Expression::ObjectExpression(obj) => obj.properties.is_empty(),
        _ => false,
    }
}

/// One member assignment of the enum body: `X["A"] = value` or the
/// reverse-mapping form `X[X["A"] = value] = "A"`. The assigned values must be
/// pure; member reads are not accepted as pure here because a getter could
/// observe the rewrite.
fn check_enum_assignment(
    assignment: &oxc_ast::ast::AssignmentExpression,
    name: &str,
) -> AssignmentCheck {
    if assignment.operator != AssignmentOperator::Assign {
        return AssignmentCheck::WrongShape;
    }

    let key_expr = match &assignment.left {
        AssignmentTarget::ComputedMemberExpression(member) => {
            if !is_named_identifier(&member.object, name) {
                return AssignmentCheck::WrongShape;
            }
            Some(&member.expression)
        }
        AssignmentTarget::StaticMemberExpression(member) => {
            if !is_named_identifier(&member.object, name) {
                return AssignmentCheck::WrongShape;
            }
            None
        }
        _ => return AssignmentCheck::WrongShape,
    };

    // Reverse-mapping keys nest a second assignment into the same object.
    if let Some(key) = key_expr {
        match unwrap_parens(key) {
            Expression::AssignmentExpression(inner) => {
                match check_enum_assignment(inner, name) {
                    AssignmentCheck::Pure => {}
                    other => return other,
                }
            }
            key if is_pure_expression(key, false) => {}
            _ => return AssignmentCheck::Impure,
        }
    }

    if is_pure_expression(&assignment.right, false) {
        AssignmentCheck::Pure
    } else {
        AssignmentCheck::Impure
    }
}

fn is_named_identifier(expr: &Expression, name: &str) -> bool {
    matches!(
        unwrap_parens(expr),
        Expression::Identifier(ident) if ident.name.as_str() == name
    )
}

/// Dotted name of a callee built from identifiers and static member access,
/// e.g. `Object.defineProperty`. `None` for anything we cannot name.
fn dotted_callee_name(expr: &Expression) -> Option<String> {
    match unwrap_parens(expr) {
        Expression::Identifier(ident) => Some(ident.name.to_string()),
        Expression::StaticMemberExpression(member) => {
            let object = dotted_callee_name(&member.object)?;
            Some(format!("{}.{}", object, member.property.name))
        }
        _ => None,
    }
}

/// Conservative purity: only shapes guaranteed free of observable side
/// effects. `allow_member_reads` admits static property chains (used for
/// metadata arguments, where a class reference like `app.Button` is routine).
fn is_pure_expression(expr: &Expression, allow_member_reads: bool) -> bool {
    match expr {
        Expression::NumericLiteral(_)
        | Expression::StringLiteral(_)
        | Expression::BooleanLiteral(_)
        | Expression::NullLiteral(_)
        | Expression::BigIntLiteral(_)
        | Expression::RegExpLiteral(_)
        | Expression::Identifier(_)
        | Expression::FunctionExpression(_)
        | Expression::ArrowFunctionExpression(_) => true,
        Expression::ParenthesizedExpression(paren) => {
            is_pure_expression(&paren.expression, allow_member_reads)
        }
        Expression::TemplateLiteral(template) => template
            .expressions
            .iter()
            .all(|e| is_pure_expression(e, allow_member_reads)),
        Expression::UnaryExpression(unary) => {
            unary.operator != UnaryOperator::Delete
                && is_pure_expression(&unary.argument, allow_member_reads)
        }
        Expression::BinaryExpression(binary) => {
            // `in`/`instanceof` can throw on non-object operands.
            !matches!(
                binary.operator,
                BinaryOperator::In | BinaryOperator::Instanceof
            )
                && is_pure_expression(&binary.left, allow_member_reads)
                && is_pure_expression(&binary.right, allow_member_reads)
        }
        Expression::LogicalExpression(logical) => {
            is_pure_expression(&logical.left, allow_member_reads)
                && is_pure_expression(&logical.right, allow_member_reads)
        }
        Expression::ConditionalExpression(cond) => {
            is_pure_expression(&cond.test, allow_member_reads)
                && is_pure_expression(&cond.consequent, allow_member_reads)
                && is_pure_expression(&cond.alternate, allow_member_reads)
        }
        Expression::ArrayExpression(array) => array.elements.iter().all(|element| {
            element
                .as_expression()
                .map(|e| is_pure_expression(e, allow_member_reads))
                // Elisions are fine; spreads are not provably pure.
                .unwrap_or(element.is_elision())
        }),
        Expression::ObjectExpression(object) => {
            object.properties.iter().all(|property| match property {
                oxc_ast::ast::ObjectPropertyKind::ObjectProperty(p) => {
                    !p.computed && is_pure_expression(&p.value, allow_member_reads)
                }
                oxc_ast::ast::ObjectPropertyKind::SpreadProperty(_) => false,
            })
        }
        Expression::StaticMemberExpression(member) if allow_member_reads => {
            is_pure_expression(&member.object, allow_member_reads)
        }
        _ => false,
    }
}

fn argument_is_side_effect_free(argument: &Argument) -> bool {
    argument
        .as_expression()
        .map(|e| is_pure_expression(unwrap_parens(e), true))
        .unwrap_or(false)
}

/// True when the text immediately before `offset` already ends with a pure
/// marker (either spelling), ignoring whitespace.
fn preceded_by_pure_marker(source: &str, offset: usize) -> bool {
    let before = source[..offset].trim_end();
    before.ends_with(PURE_MARKER) || before.ends_with(PURE_MARKER_HASH)
}

/// Extend a removal past the statement's semicolon and one trailing newline so
/// elision does not leave blank lines behind.
fn consume_statement_tail(source: &str, mut end: usize) -> usize {
    let bytes = source.as_bytes();
    while end < bytes.len() && bytes[end] == b';' {
        end += 1;
    }
    while end < bytes.len() && (bytes[end] == b' ' || bytes[end] == b'\t' || bytes[end] == b'\r') {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'\n' {
        end += 1;
    }
    end
}

/// Sort replacement spans in reverse and splice them into the source text.
fn apply_replacements(source: &str, mut replacements: Vec<(u32, u32, String)>) -> String {
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    let mut result = source.to_string();
    for (start, end, replacement) in replacements {
        result.replace_range((start as usize)..(end as usize), &replacement);
    }
    result
}
