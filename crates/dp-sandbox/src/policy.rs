//! Static policy: reject dangerous constructs before any process is
//! spawned.
//!
//! The snippet is scanned with string literals and comments blanked
//! out, so rules cannot be dodged by quoting and cannot false-positive
//! on prose. Import statements are parsed and checked against a module
//! allowlist with per-module submodule sets; everything else is a
//! compiled rule set over the cleaned source.

use std::sync::OnceLock;

use regex::{Regex, RegexSet};

use crate::types::Language;

/// A rejected construct, with enough context for the model to fix it.
#[derive(Debug, Clone)]
pub struct PolicyViolation {
    pub construct: String,
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: {} ({})",
            self.line, self.message, self.construct
        )
    }
}

/// A parsed import statement from the cleaned source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStmt {
    pub line: usize,
    /// Dotted module path, e.g. `scipy.stats`.
    pub module: String,
    /// `from X import a, b as c` items as `(name, alias)`.
    pub items: Vec<(String, Option<String>)>,
    /// `import X as y` alias.
    pub alias: Option<String>,
}

/// Check a snippet. Returns the validated imports (used by the
/// executor to rewrite them onto pre-bound modules) or the first set
/// of violations found.
pub fn check(code: &str, language: Language) -> Result<Vec<ImportStmt>, Vec<PolicyViolation>> {
    match language {
        Language::Python => check_python(code),
        Language::R => check_r(code).map(|()| Vec::new()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source cleaning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Blank out string literal contents and comments, preserving line
/// structure so violation line numbers stay accurate.
pub fn strip_strings_and_comments(code: &str, language: Language) -> String {
    // '#' opens a comment in both Python and R.
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let triple_quotes = language == Language::Python;

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                // Drop to end of line.
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '"' | '\'' => {
                let quote = c;
                // Detect triple quotes.
                let mut is_triple = false;
                if triple_quotes {
                    let mut clone = chars.clone();
                    if clone.next() == Some(quote) && clone.next() == Some(quote) {
                        is_triple = true;
                        chars.next();
                        chars.next();
                    }
                }
                out.push(quote);
                if is_triple {
                    out.push(quote);
                    out.push(quote);
                }
                // Consume until the matching close, keeping newlines.
                let mut run = 0usize;
                let mut escaped = false;
                while let Some(n) = chars.next() {
                    if escaped {
                        escaped = false;
                        continue;
                    }
                    match n {
                        '\\' => escaped = true,
                        '\n' => out.push('\n'),
                        q if q == quote => {
                            if !is_triple {
                                out.push(quote);
                                break;
                            }
                            run += 1;
                            if run == 3 {
                                out.push(quote);
                                out.push(quote);
                                out.push(quote);
                                break;
                            }
                            continue;
                        }
                        _ => {}
                    }
                    if n != quote {
                        run = 0;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Python rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Module allowlist. `None` permits any submodule of the root;
/// `Some(list)` permits exactly those.
const PY_ALLOWLIST: &[(&str, Option<&[&str]>)] = &[
    ("pandas", None),
    ("numpy", None),
    (
        "scipy",
        Some(&[
            "stats",
            "optimize",
            "interpolate",
            "signal",
            "linalg",
            "cluster",
            "spatial",
            "special",
        ]),
    ),
    ("statsmodels", None),
    ("sklearn", None),
    ("matplotlib", None),
    ("plotly", None),
    ("seaborn", None),
    // The in-sandbox helper module (workspace-bound file access,
    // figure saving).
    ("dptools", None),
];

struct PyRules {
    set: RegexSet,
    patterns: Vec<(Regex, &'static str)>,
}

fn py_rules() -> &'static PyRules {
    static RULES: OnceLock<PyRules> = OnceLock::new();
    RULES.get_or_init(|| {
        let specs: &[(&str, &str)] = &[
            (r"__import__", "dynamic import is not available"),
            (r"\beval\s*\(", "eval is not available"),
            (r"\bexec\s*\(", "exec is not available"),
            (r"\bcompile\s*\(", "compile is not available"),
            (
                r"\bopen\s*\(",
                "direct file access is not available; use dptools.read_text / dptools.write_text",
            ),
            (r"\bbreakpoint\s*\(", "debugger hooks are not available"),
            (r"\bglobals\s*\(", "namespace reflection is not available"),
            (r"\blocals\s*\(", "namespace reflection is not available"),
            (r"\bvars\s*\(", "namespace reflection is not available"),
            (r"\bdir\s*\(", "namespace reflection is not available"),
            (r"\btype\s*\(", "type reflection is not available"),
            (r"\bgetattr\s*\(", "reflective attribute lookup is not available"),
            (r"\bsetattr\s*\(", "reflective attribute mutation is not available"),
            (r"\bdelattr\s*\(", "reflective attribute mutation is not available"),
            (r"__builtins__", "the builtins table is not accessible"),
            (
                r"\.\s*__[A-Za-z0-9_]+__",
                "dunder attribute access is not available",
            ),
        ];
        let set = RegexSet::new(specs.iter().map(|(p, _)| *p)).expect("static patterns");
        let patterns = specs
            .iter()
            .map(|(p, m)| (Regex::new(p).expect("static pattern"), *m))
            .collect();
        PyRules { set, patterns }
    })
}

fn check_python(code: &str) -> Result<Vec<ImportStmt>, Vec<PolicyViolation>> {
    let cleaned = strip_strings_and_comments(code, Language::Python);
    let mut violations = Vec::new();

    let rules = py_rules();
    if rules.set.is_match(&cleaned) {
        for (regex, message) in &rules.patterns {
            if let Some(m) = regex.find(&cleaned) {
                violations.push(PolicyViolation {
                    construct: m.as_str().trim().to_string(),
                    line: line_of(&cleaned, m.start()),
                    message: (*message).to_string(),
                });
            }
        }
    }

    let mut imports = Vec::new();
    for (idx, line) in cleaned.lines().enumerate() {
        let trimmed = line.trim();
        if let Some(stmt) = parse_import_line(trimmed, idx + 1) {
            match validate_import(&stmt) {
                Ok(()) => imports.push(stmt),
                Err(message) => violations.push(PolicyViolation {
                    construct: trimmed.to_string(),
                    line: idx + 1,
                    message,
                }),
            }
        }
    }

    if violations.is_empty() {
        Ok(imports)
    } else {
        Err(violations)
    }
}

/// Parse `import a.b as c` / `from a.b import x, y as z`. Multi-module
/// `import a, b` lines produce one statement per module via the caller
/// looping — here we reject them to keep the rewrite simple; the model
/// splits them on retry.
fn parse_import_line(line: &str, line_no: usize) -> Option<ImportStmt> {
    if let Some(rest) = line.strip_prefix("from ") {
        let (module, items_str) = rest.split_once(" import ")?;
        let items = items_str
            .split(',')
            .map(|item| {
                let item = item.trim();
                match item.split_once(" as ") {
                    Some((name, alias)) => {
                        (name.trim().to_string(), Some(alias.trim().to_string()))
                    }
                    None => (item.to_string(), None),
                }
            })
            .collect();
        return Some(ImportStmt {
            line: line_no,
            module: module.trim().to_string(),
            items,
            alias: None,
        });
    }
    if let Some(rest) = line.strip_prefix("import ") {
        let rest = rest.trim();
        let (module, alias) = match rest.split_once(" as ") {
            Some((m, a)) => (m.trim().to_string(), Some(a.trim().to_string())),
            None => (rest.to_string(), None),
        };
        return Some(ImportStmt {
            line: line_no,
            module,
            items: Vec::new(),
            alias,
        });
    }
    None
}

fn validate_import(stmt: &ImportStmt) -> Result<(), String> {
    if stmt.module.contains(',') {
        return Err("one import per line, please".into());
    }
    let mut parts = stmt.module.split('.');
    let root = parts.next().unwrap_or_default();

    let Some((_, submodules)) = PY_ALLOWLIST.iter().find(|(name, _)| *name == root) else {
        return Err(format!("module \"{root}\" is not on the allowlist"));
    };

    if let Some(allowed) = submodules {
        if let Some(sub) = parts.next() {
            if !allowed.contains(&sub) {
                return Err(format!(
                    "submodule \"{root}.{sub}\" is not on the allowlist"
                ));
            }
        }
        // `from scipy import io` names the submodule as an item.
        if stmt.module == root {
            for (item, _) in &stmt.items {
                if !allowed.contains(&item.as_str()) {
                    return Err(format!(
                        "submodule \"{root}.{item}\" is not on the allowlist"
                    ));
                }
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// R rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const R_ALLOWLIST: &[&str] = &[
    "stats", "ggplot2", "dplyr", "tidyr", "readr", "broom", "jsonlite",
];

fn r_rules() -> &'static Vec<(Regex, &'static str)> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        let specs: &[(&str, &str)] = &[
            (r"\bsystem\s*\(", "system() is not available"),
            (r"\bsystem2\s*\(", "system2() is not available"),
            (r"\bshell\s*\(", "shell() is not available"),
            (r"\bsource\s*\(", "source() is not available"),
            (r"\beval\s*\(\s*parse\s*\(", "eval(parse()) is not available"),
            (r"\bfile\s*\(", "raw connections are not available"),
            (r"\burl\s*\(", "network connections are not available"),
            (r"\bdownload\.file\s*\(", "downloads are not available"),
            (r"\bSys\.setenv\s*\(", "environment mutation is not available"),
            (r"\bunlink\s*\(", "file deletion is not available"),
        ];
        specs
            .iter()
            .map(|(p, m)| (Regex::new(p).expect("static pattern"), *m))
            .collect()
    })
}

fn check_r(code: &str) -> Result<(), Vec<PolicyViolation>> {
    let cleaned = strip_strings_and_comments(code, Language::R);
    let mut violations = Vec::new();

    for (regex, message) in r_rules() {
        if let Some(m) = regex.find(&cleaned) {
            violations.push(PolicyViolation {
                construct: m.as_str().trim().to_string(),
                line: line_of(&cleaned, m.start()),
                message: (*message).to_string(),
            });
        }
    }

    // library()/require() calls against the allowlist.
    let lib_re = Regex::new(r"\b(?:library|require)\s*\(\s*([A-Za-z0-9._]+)\s*\)")
        .expect("static pattern");
    for caps in lib_re.captures_iter(&cleaned) {
        let package = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if !R_ALLOWLIST.contains(&package) {
            let m = caps.get(0).unwrap();
            violations.push(PolicyViolation {
                construct: m.as_str().to_string(),
                line: line_of(&cleaned, m.start()),
                message: format!("package \"{package}\" is not on the allowlist"),
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn line_of(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset].matches('\n').count() + 1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
