//! Java entry-point normalization
//!
//! Users paste anything from a bare `System.out.println` to a full file with
//! a package and a class of their own naming. The run command expects one
//! class with a fixed name and a static `main`, so the source is reshaped:
//!
//! 1. `package` declarations are dropped.
//! 2. The top-level class that declares `main` (else the first public one,
//!    else the first one) is renamed to the fixed name, together with every
//!    whole-word reference to it. Other top-level classes lose `public`.
//! 3. If that class has no `main`, its body is wrapped in one.
//! 4. With no class at all, the statements are wrapped in the full
//!    class-and-main scaffold; `import` lines stay above it.
//!
//! This is a textual heuristic for shape correction only. It is not a
//! security boundary. Comments and string/char literals are masked out
//! before any matching, so their contents are never rewritten. Running it
//! on its own output is a no-op.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

const MAIN_OPEN: &str = "\n    public static void main(String[] args) throws Exception {\n";
const MAIN_CLOSE: &str = "\n    }\n";

/// Patterns the rewrite matches against masked source
struct JavaPatterns {
    package_decl: Regex,
    class_decl: Regex,
    main_decl: Regex,
    import_line: Regex,
    public_modifier: Regex,
}

impl JavaPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            package_decl: Regex::new(r"(?m)^[ \t]*package\s+[\w.]+\s*;[ \t]*\r?\n?")?,
            class_decl: Regex::new(
                r"\b(?P<mods>(?:(?:public|protected|private|abstract|final|static|strictfp)\s+)*)class\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)",
            )?,
            main_decl: Regex::new(r"\bstatic\s+(?:final\s+)?void\s+main\s*\(")?,
            import_line: Regex::new(r"^\s*import\s+(?:static\s+)?[\w.]+(?:\.\*)?\s*;\s*$")?,
            public_modifier: Regex::new(r"\bpublic\s+")?,
        })
    }
}

static PATTERNS: OnceLock<Option<JavaPatterns>> = OnceLock::new();

fn patterns() -> Option<&'static JavaPatterns> {
    PATTERNS
        .get_or_init(|| match JavaPatterns::compile() {
            Ok(patterns) => Some(patterns),
            Err(e) => {
                warn!("Java rewrite patterns failed to compile, leaving sources as-is: {}", e);
                None
            }
        })
        .as_ref()
}

#[derive(Debug)]
struct ClassDecl {
    name: String,
    /// Byte range of a `public ` modifier, if present
    public_range: Option<Range<usize>>,
    /// Positions of the opening and matching closing brace
    body: Option<(usize, usize)>,
}

/// Reshape `code` so it compiles as `class_name.java` with a runnable main
pub fn normalize_java(code: &str, class_name: &str) -> String {
    let Some(patterns) = patterns() else {
        return code.to_string();
    };

    let code = strip_packages(patterns, code);
    let masked = mask_literals(&code);
    let classes = top_level_classes(patterns, &masked);

    if classes.is_empty() {
        return wrap_statements(patterns, &code, &masked, class_name);
    }

    let target_idx = choose_target(patterns, &classes, &masked);
    let target = &classes[target_idx];
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();

    for (idx, class) in classes.iter().enumerate() {
        if idx == target_idx {
            continue;
        }
        if let Some(range) = &class.public_range {
            edits.push((range.clone(), String::new()));
        }
    }

    if target.name != class_name {
        let word = format!(r"\b{}\b", regex::escape(&target.name));
        if let Ok(word) = Regex::new(&word) {
            for m in word.find_iter(&masked) {
                edits.push((m.range(), class_name.to_string()));
            }
        }
    }

    if let Some((open, close)) = target.body {
        if !patterns.main_decl.is_match(&masked[open..close]) {
            edits.push((open + 1..open + 1, MAIN_OPEN.to_string()));
            edits.push((close..close, MAIN_CLOSE.to_string()));
        }
    }

    apply_edits(&code, edits)
}

fn strip_packages(patterns: &JavaPatterns, code: &str) -> String {
    let masked = mask_literals(code);
    let edits = patterns
        .package_decl
        .find_iter(&masked)
        .map(|m| (m.range(), String::new()))
        .collect();
    apply_edits(code, edits)
}

fn top_level_classes(patterns: &JavaPatterns, masked: &str) -> Vec<ClassDecl> {
    patterns
        .class_decl
        .captures_iter(masked)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if brace_depth(&masked[..whole.start()]) != 0 {
                return None;
            }
            let mods = caps.name("mods")?;
            let name = caps.name("name")?;

            let public_range = patterns
                .public_modifier
                .find(mods.as_str())
                .map(|m| mods.start() + m.start()..mods.start() + m.end());

            let rest = &masked[name.end()..];
            let body = rest
                .find(['{', ';'])
                .filter(|&off| rest.as_bytes()[off] == b'{')
                .and_then(|off| {
                    let open = name.end() + off;
                    matching_brace(masked, open).map(|close| (open, close))
                });

            Some(ClassDecl {
                name: name.as_str().to_string(),
                public_range,
                body,
            })
        })
        .collect()
}

fn choose_target(patterns: &JavaPatterns, classes: &[ClassDecl], masked: &str) -> usize {
    let declares_main = |class: &ClassDecl| {
        class
            .body
            .map(|(open, close)| patterns.main_decl.is_match(&masked[open..close]))
            .unwrap_or(false)
    };

    classes
        .iter()
        .position(declares_main)
        .or_else(|| classes.iter().position(|c| c.public_range.is_some()))
        .unwrap_or(0)
}

/// Bare statements: hoist imports, wrap the rest in the entry scaffold
fn wrap_statements(patterns: &JavaPatterns, code: &str, masked: &str, class_name: &str) -> String {
    let mut imports = String::new();
    let mut body = String::new();

    for (line, masked_line) in code.split_inclusive('\n').zip(masked.split_inclusive('\n')) {
        if patterns.import_line.is_match(masked_line) {
            imports.push_str(line);
            if !line.ends_with('\n') {
                imports.push('\n');
            }
        } else {
            body.push_str(line);
        }
    }

    let mut out = String::with_capacity(code.len() + 128);
    if !imports.is_empty() {
        out.push_str(&imports);
        out.push('\n');
    }
    out.push_str("public class ");
    out.push_str(class_name);
    out.push_str(" {");
    out.push_str(MAIN_OPEN);
    out.push_str(body.trim_end_matches(['\n', '\r']));
    out.push_str(MAIN_CLOSE);
    out.push_str("}\n");
    out
}

/// Apply non-overlapping edits, back to front so earlier offsets stay valid
fn apply_edits(code: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start).then(b.0.end.cmp(&a.0.end)));
    let mut out = code.to_string();
    for (range, replacement) in edits {
        out.replace_range(range, &replacement);
    }
    out
}

fn brace_depth(masked: &str) -> i64 {
    masked.bytes().fold(0, |depth, b| match b {
        b'{' => depth + 1,
        b'}' => depth - 1,
        _ => depth,
    })
}

fn matching_brace(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0i64;
    for (idx, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Blank out comments and string/char literals (newlines kept) so that
/// byte offsets in the result line up with `code`.
fn mask_literals(code: &str) -> String {
    let bytes = code.as_bytes();
    let len = bytes.len();
    let mut out = bytes.to_vec();
    let mut i = 0;

    while i < len {
        let end = match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                Some(find_from(bytes, i + 2, b"\n").unwrap_or(len))
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                Some(find_from(bytes, i + 2, b"*/").map_or(len, |p| p + 2))
            }
            b'"' if bytes[i..].starts_with(b"\"\"\"") => {
                Some(find_from(bytes, i + 3, b"\"\"\"").map_or(len, |p| p + 3))
            }
            quote @ (b'"' | b'\'') => Some(scan_quoted(bytes, i + 1, quote)),
            _ => None,
        };

        match end {
            Some(end) => {
                for b in &mut out[i..end] {
                    if *b != b'\n' {
                        *b = b' ';
                    }
                }
                i = end;
            }
            None => i += 1,
        }
    }

    // Only whole literals (ASCII-delimited) were blanked, so this stays UTF-8
    String::from_utf8(out).unwrap_or_else(|_| code.to_string())
}

fn scan_quoted(bytes: &[u8], mut j: usize, quote: u8) -> usize {
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
