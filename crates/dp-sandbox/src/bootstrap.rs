//! Worker bootstrap generation.
//!
//! The worker process runs a generated program that pre-imports the
//! module allowlist, installs a restricted builtins table WITHOUT the
//! import primitive, binds the session's datasets, executes the
//! snippet, intercepts figures, and writes a sentinel-framed JSON
//! result to stdout. The module set available to a snippet is frozen
//! here; nothing the snippet does can extend it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::policy::ImportStmt;
use crate::types::Language;

/// Markers framing the structured result on the worker's stdout.
pub const RESULT_BEGIN: &str = "__DP_RESULT_BEGIN__";
pub const RESULT_END: &str = "__DP_RESULT_END__";

/// Manifest handed to the worker as its single argument (JSON file).
#[derive(Debug, serde::Serialize)]
pub struct WorkerManifest {
    pub snippet_path: PathBuf,
    pub datasets: HashMap<String, PathBuf>,
    pub artifacts_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// Write `output_df` here as CSV when set.
    pub save_dataset_path: Option<PathBuf>,
    pub save_dataset_name: Option<String>,
}

/// Rewrite validated import statements onto the pre-bound modules.
///
/// The restricted builtins exclude `__import__`, so `import pandas as
/// pd` would raise at runtime even though it is allowlisted. Each
/// validated statement becomes a plain assignment from the frozen
/// module table, keeping snippet aliases working.
pub fn rewrite_imports(code: &str, imports: &[ImportStmt]) -> String {
    if imports.is_empty() {
        return code.to_string();
    }
    let by_line: HashMap<usize, &ImportStmt> =
        imports.iter().map(|stmt| (stmt.line, stmt)).collect();

    code.lines()
        .enumerate()
        .map(|(idx, line)| {
            let Some(stmt) = by_line.get(&(idx + 1)) else {
                return line.to_string();
            };
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            let mut assigns: Vec<String> = Vec::new();

            if stmt.items.is_empty() {
                // `import a.b as c` → c = _dp_modules["a.b"]
                let target = stmt
                    .alias
                    .clone()
                    .unwrap_or_else(|| stmt.module.split('.').next().unwrap_or("").to_string());
                let source = if stmt.alias.is_some() {
                    stmt.module.clone()
                } else {
                    // Bare `import a.b` binds the root name.
                    stmt.module.split('.').next().unwrap_or("").to_string()
                };
                assigns.push(format!("{target} = _dp_module(\"{source}\")"));
            } else {
                // `from a import x as y` → y = _dp_module("a.x") or attr.
                for (item, alias) in &stmt.items {
                    let target = alias.clone().unwrap_or_else(|| item.clone());
                    assigns.push(format!(
                        "{target} = _dp_member(\"{}\", \"{item}\")",
                        stmt.module
                    ));
                }
            }
            format!("{indent}{}", assigns.join("; "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generate the Python worker program.
pub fn python_bootstrap() -> &'static str {
    PY_BOOTSTRAP
}

/// Generate the R worker program wrapping a snippet file.
pub fn r_bootstrap(snippet_path: &Path, artifacts_dir: &Path) -> String {
    format!(
        "args <- NULL\n\
         options(device = function(...) grDevices::png(file.path(\"{artifacts}\", \"figure-%03d.png\"), ...))\n\
         source_result <- tryCatch({{\n\
           sys.source(\"{snippet}\", envir = new.env(parent = globalenv()))\n\
           \"ok\"\n\
         }}, error = function(e) conditionMessage(e))\n\
         grDevices::graphics.off()\n\
         cat(\"{begin}\\n\")\n\
         if (identical(source_result, \"ok\")) {{\n\
           cat(\"{{\\\"ok\\\": true}}\\n\")\n\
         }} else {{\n\
           cat(sprintf(\"{{\\\"ok\\\": false, \\\"error\\\": %s}}\\n\", deparse(source_result)))\n\
         }}\n\
         cat(\"{end}\\n\")\n",
        artifacts = artifacts_dir.display(),
        snippet = snippet_path.display(),
        begin = RESULT_BEGIN,
        end = RESULT_END,
    )
}

pub fn bootstrap_filename(language: Language) -> &'static str {
    match language {
        Language::Python => "bootstrap.py",
        Language::R => "bootstrap.R",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Python worker program
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const PY_BOOTSTRAP: &str = r#"
import builtins as _builtins
import json as _json
import sys as _sys
import traceback as _traceback
import types as _types

_manifest = _json.load(open(_sys.argv[1]))

# ── Frozen module table ────────────────────────────────────────────
_MODULES = {}

def _preload(name):
    try:
        _MODULES[name] = __import__(name, fromlist=["_"] if "." in name else [])
    except Exception:
        pass

for _name in (
    "pandas", "numpy",
    "scipy", "scipy.stats", "scipy.optimize", "scipy.interpolate",
    "scipy.signal", "scipy.linalg", "scipy.cluster", "scipy.spatial",
    "scipy.special",
    "statsmodels", "statsmodels.api",
    "sklearn",
    "matplotlib", "seaborn", "plotly", "plotly.graph_objects",
):
    _preload(_name)

if "matplotlib" in _MODULES:
    _MODULES["matplotlib"].use("Agg")
    _preload("matplotlib.pyplot")

def _dp_module(name):
    if name in _MODULES:
        return _MODULES[name]
    raise ImportError("module %r is not available in the sandbox" % name)

def _dp_member(module, item):
    dotted = module + "." + item
    if dotted in _MODULES:
        return _MODULES[dotted]
    return _builtins.getattr(_dp_module(module), item)

# ── Workspace helper (the only file access surface) ────────────────
import os as _os

_ARTIFACTS = _manifest["artifacts_dir"]
_SCRATCH = _manifest["scratch_dir"]
_saved_artifacts = []

def _contained(root, rel):
    path = _os.path.realpath(_os.path.join(root, rel))
    if not path.startswith(_os.path.realpath(root) + _os.sep):
        raise PermissionError("path escapes the workspace: %r" % rel)
    return path

class _DpTools(_types.SimpleNamespace):
    def read_text(self, name):
        with open(_contained(_SCRATCH, name)) as fh:
            return fh.read()

    def write_text(self, name, text):
        path = _contained(_SCRATCH, name)
        _os.makedirs(_os.path.dirname(path), exist_ok=True)
        with open(path, "w") as fh:
            fh.write(text)
        return name

    def save_figure(self, fig, name):
        path = _contained(_ARTIFACTS, name)
        _os.makedirs(_os.path.dirname(path), exist_ok=True)
        if hasattr(fig, "savefig"):
            fig.savefig(path, bbox_inches="tight")
        elif hasattr(fig, "write_html"):
            fig.write_html(path)
        else:
            raise TypeError("unsupported figure object")
        _saved_artifacts.append(name)
        return name

dptools = _DpTools()

# ── Restricted builtins (no import primitive) ──────────────────────
_SAFE_NAMES = (
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes",
    "callable", "chr", "complex", "dict", "divmod", "enumerate", "filter",
    "float", "format", "frozenset", "hash", "hex", "id", "int",
    "isinstance", "issubclass", "iter", "len", "list", "map", "max",
    "min", "next", "object", "oct", "ord", "pow", "print", "range",
    "repr", "reversed", "round", "set", "slice", "sorted", "str", "sum",
    "tuple", "zip", "True", "False", "None", "Exception", "ValueError",
    "TypeError", "KeyError", "IndexError", "ZeroDivisionError",
    "ArithmeticError", "StopIteration", "RuntimeError",
)
_safe_builtins = {}
for _name in _SAFE_NAMES:
    if hasattr(_builtins, _name):
        _safe_builtins[_name] = getattr(_builtins, _name)

# ── Dataset bindings (read-only frames) ────────────────────────────
_ns = {"__builtins__": _safe_builtins, "dptools": dptools, "result": None, "output_df": None}

datasets = {}
if "pandas" in _MODULES:
    for _name, _path in _manifest["datasets"].items():
        try:
            datasets[_name] = _MODULES["pandas"].read_csv(_path)
        except Exception as exc:
            print("failed to load dataset %s: %s" % (_name, exc), file=_sys.stderr)
_ns["datasets"] = datasets
for _name, _frame in datasets.items():
    if _name.isidentifier() and _name not in _ns:
        _ns[_name] = _frame

# ── Execute ────────────────────────────────────────────────────────
_outcome = {"ok": True, "error_type": None, "error": None,
            "result": None, "df_preview": None, "saved_dataset": None,
            "artifacts": []}

with open(_manifest["snippet_path"]) as _fh:
    _snippet = _fh.read()

try:
    exec(compile(_snippet, "<snippet>", "exec"), _ns)
except BaseException:
    _outcome["ok"] = False
    _outcome["error_type"] = "runtime"
    _outcome["error"] = _traceback.format_exc()

# ── Figure interception: any figure left open is an artifact ───────
if _outcome["ok"] and "matplotlib.pyplot" in _MODULES:
    _plt = _MODULES["matplotlib.pyplot"]
    for _i, _num in enumerate(_plt.get_fignums()):
        _fname = "figure-%02d.png" % (_i + 1)
        try:
            _plt.figure(_num).savefig(
                _os.path.join(_ARTIFACTS, _fname), bbox_inches="tight")
            _saved_artifacts.append(_fname)
        except Exception as exc:
            print("failed to save figure: %s" % exc, file=_sys.stderr)
    _plt.close("all")
_outcome["artifacts"] = _saved_artifacts

# ── Result serialization (JSON-safe or rejected) ───────────────────
def _json_safe(value):
    _json.dumps(value)
    return value

if _outcome["ok"]:
    _result = _ns.get("result")
    if _result is not None:
        try:
            _outcome["result"] = _json_safe(_result)
        except (TypeError, ValueError):
            _outcome["ok"] = False
            _outcome["error_type"] = "runtime"
            _outcome["error"] = (
                "the `result` value is not JSON-serializable: %r" % type(_result).__name__)

_df = _ns.get("output_df")
if _outcome["ok"] and _df is not None and "pandas" in _MODULES:
    _pd = _MODULES["pandas"]
    if isinstance(_df, _pd.DataFrame):
        _head = _df.head(20)
        _outcome["df_preview"] = {
            "columns": [str(c) for c in _df.columns],
            "rows": _json.loads(_head.to_json(orient="values")),
            "row_count": int(len(_df)),
        }
        if _manifest.get("save_dataset_path"):
            _df.to_csv(_manifest["save_dataset_path"], index=False)
            _outcome["saved_dataset"] = _manifest.get("save_dataset_name")
    else:
        print("output_df is not a DataFrame; ignoring", file=_sys.stderr)

print("%s" % "__DP_RESULT_BEGIN__")
print(_json.dumps(_outcome))
print("%s" % "__DP_RESULT_END__")
"#;
