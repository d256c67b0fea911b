//! Per-language normalizers applied before hashing.
//!
//! A normalizer maps source bytes to a canonical form in which comments and
//! layout no longer appear, so edits that only touch those leave the hash
//! alone. Returning `None` means "cannot normalize this", and the hasher
//! falls back to the raw bytes.
//!
//! Python gets a structural normalizer (a parse tree reduced to node kinds,
//! field names and leaf values). C-family languages get a regex pass that
//! drops comments and collapses whitespace; that pass is deliberately weak
//! and may both miss and invent drift (a `//` inside a string literal is
//! treated as a comment, for instance).

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tree_sitter::{Parser, TreeCursor};

pub trait SemanticNormalizer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Lowercase extensions (without dot) this normalizer claims
    fn extensions(&self) -> &'static [&'static str];

    fn try_normalize(&self, bytes: &[u8]) -> Option<Vec<u8>>;
}

/// Extension -> normalizer lookup.
///
/// New languages are added with [`NormalizerRegistry::register`]; the hasher
/// never branches on languages itself.
#[derive(Default, Clone)]
pub struct NormalizerRegistry {
    by_extension: HashMap<String, Arc<dyn SemanticNormalizer>>,
}

impl NormalizerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PythonNormalizer));
        registry.register(Arc::new(CStyleNormalizer));
        registry
    }

    /// Register a normalizer for all of its extensions, replacing any
    /// previous claim on them.
    pub fn register(&mut self, normalizer: Arc<dyn SemanticNormalizer>) {
        for ext in normalizer.extensions() {
            self.by_extension
                .insert((*ext).to_string(), Arc::clone(&normalizer));
        }
    }

    pub fn for_path(&self, path: &Path) -> Option<&Arc<dyn SemanticNormalizer>> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        self.by_extension.get(&ext)
    }
}

/// Structural normalizer for Python built on the tree-sitter grammar.
///
/// Emits an s-expression of node kinds and field names. Named leaves carry
/// their text; string literals carry their content and prefix but not their
/// quote style. Any syntax error rejects the input.
pub struct PythonNormalizer;

/// Node kinds that carry layout or commentary only
const PYTHON_SKIPPED: &[&str] = &["comment", "line_continuation"];

impl SemanticNormalizer for PythonNormalizer {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn try_normalize(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let source = std::str::from_utf8(bytes).ok()?;

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .ok()?;
        let tree = parser.parse(source, None)?;
        if tree.root_node().has_error() {
            return None;
        }

        let mut out = String::with_capacity(source.len());
        emit_python_tree(tree.walk(), source.as_bytes(), &mut out)?;
        Some(out.into_bytes())
    }
}

/// Pre-order walk driven by the cursor alone, so nesting depth costs no
/// call stack.
fn emit_python_tree(mut cursor: TreeCursor, src: &[u8], out: &mut String) -> Option<()> {
    loop {
        if open_python_node(&cursor, src, out)? && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return Some(());
            }
            out.push(')');
        }
    }
}

/// Write the cursor's node. Returns true when its children come next and
/// its closing paren is still owed.
fn open_python_node(cursor: &TreeCursor, src: &[u8], out: &mut String) -> Option<bool> {
    let node = cursor.node();
    let kind = node.kind();
    if PYTHON_SKIPPED.contains(&kind) {
        return Some(false);
    }

    if let Some(field) = cursor.field_name() {
        out.push_str(field);
        out.push(':');
    }
    out.push('(');
    out.push_str(kind);

    match kind {
        // Literal body, taken whole so escapes and text stay together.
        "string_content" => {
            out.push(' ');
            out.push_str(node.utf8_text(src).ok()?);
        }
        // Keep the prefix (f, b, r...) but drop the quote characters.
        "string_start" | "string_end" => {
            let text = node.utf8_text(src).ok()?;
            let prefix: String = text
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            if !prefix.is_empty() {
                out.push(' ');
                out.push_str(&prefix);
            }
        }
        _ if node.child_count() > 0 => return Some(true),
        _ => {
            if node.is_named() {
                out.push(' ');
                out.push_str(node.utf8_text(src).ok()?);
            }
        }
    }

    out.push(')');
    Some(false)
}

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)//.*$").expect("valid line comment regex"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\*[\s\S]*?\*/").expect("valid block comment regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Best-effort normalizer for languages with `//` and `/* */` comments.
pub struct CStyleNormalizer;

impl SemanticNormalizer for CStyleNormalizer {
    fn name(&self) -> &'static str {
        "c-style"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[
            "js", "jsx", "ts", "tsx", "mjs", "cjs", "go", "rs", "java", "c", "h", "cpp", "hpp",
        ]
    }

    fn try_normalize(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let source = std::str::from_utf8(bytes).ok()?;
        let without_lines = LINE_COMMENT.replace_all(source, "");
        let without_blocks = BLOCK_COMMENT.replace_all(&without_lines, "");
        let collapsed = WHITESPACE.replace_all(&without_blocks, " ");
        Some(collapsed.trim().as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python(src: &str) -> Option<Vec<u8>> {
        PythonNormalizer.try_normalize(src.as_bytes())
    }

    #[test]
    fn test_python_ignores_comments_and_spacing() {
        let a = python("def f(a, b):\n    return a + b  # sum\n");
        let b = python("# header\ndef f(a,b):\n\n    # body\n    return a+b\n");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn test_python_ignores_quote_style() {
        assert_eq!(python("name = 'odin'\n"), python("name = \"odin\"\n"));
    }

    #[test]
    fn test_python_structural_edits_change_output() {
        let base = python("def f(a):\n    return a + 1\n");
        assert_ne!(base, python("def f(a):\n    return a + 2\n"));
        assert_ne!(base, python("def g(a):\n    return a + 1\n"));
        assert_ne!(base, python("def f(a):\n    return a - 1\n"));
        assert_ne!(python("s = 'a'\n"), python("s = b'a'\n"));
    }

    #[test]
    fn test_python_indentation_is_structural() {
        let nested = python("if x:\n    y = 1\n    z = 2\n");
        let dedented = python("if x:\n    y = 1\nz = 2\n");
        assert_ne!(nested, dedented);
    }

    #[test]
    fn test_python_syntax_error_rejected() {
        assert!(python("def broken(:\n    pass\n").is_none());
        assert!(PythonNormalizer.try_normalize(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_python_deep_nesting_fits_a_small_stack() {
        const DEPTH: usize = 20_000;
        let src = format!("x = {}{}\n", "[".repeat(DEPTH), "]".repeat(DEPTH));

        let (first, second) = std::thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(move || (python(&src), python(&src)))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(first, second);
        if let Some(out) = first {
            let out = String::from_utf8(out).unwrap();
            assert_eq!(out.matches("(list").count(), DEPTH);
            assert!(out.ends_with(&")".repeat(DEPTH)));
        }
    }

    #[test]
    fn test_python_output_shape() {
        let out = String::from_utf8(python("f(1)  # call\n").unwrap()).unwrap();
        assert!(out.starts_with("(module(expression_statement(call"));
        assert!(out.contains("function:(identifier f)"));
        assert!(out.contains("arguments:(argument_list"));
        assert!(out.contains("(integer 1)"));
        assert!(!out.contains("comment"));
        assert!(out.ends_with("))))"));
    }

    #[test]
    fn test_c_style_strips_comments_and_whitespace() {
        let a = CStyleNormalizer.try_normalize(b"const a = 1; // one\n/* block\n comment */\nlet b = 2;");
        let b = CStyleNormalizer.try_normalize(b"const a = 1;\n\n   let b = 2;   ");
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some(&b"const a = 1; let b = 2;"[..]));
    }

    #[test]
    fn test_c_style_detects_code_edits() {
        assert_ne!(
            CStyleNormalizer.try_normalize(b"let a = 1;"),
            CStyleNormalizer.try_normalize(b"let a = 2;")
        );
    }

    #[test]
    fn test_registry_dispatch_by_extension() {
        let registry = NormalizerRegistry::with_defaults();
        assert_eq!(registry.for_path(Path::new("x/app.PY")).map(|n| n.name()), Some("python"));
        assert_eq!(registry.for_path(Path::new("main.go")).map(|n| n.name()), Some("c-style"));
        assert!(registry.for_path(Path::new("README.md")).is_none());
        assert!(registry.for_path(Path::new("Makefile")).is_none());
    }

    #[test]
    fn test_register_overrides_extension() {
        struct Upper;
        impl SemanticNormalizer for Upper {
            fn name(&self) -> &'static str {
                "upper"
            }
            fn extensions(&self) -> &'static [&'static str] {
                &["go"]
            }
            fn try_normalize(&self, bytes: &[u8]) -> Option<Vec<u8>> {
                Some(bytes.to_ascii_uppercase())
            }
        }

        let mut registry = NormalizerRegistry::with_defaults();
        registry.register(Arc::new(Upper));
        assert_eq!(registry.for_path(Path::new("main.go")).map(|n| n.name()), Some("upper"));
        assert_eq!(registry.for_path(Path::new("main.rs")).map(|n| n.name()), Some("c-style"));
    }
}
