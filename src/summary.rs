/// Workspace digest -- zero model calls, pure text scan.
///
/// Produces the compact codebase summary injected into the plan prompt:
/// file tree with line counts, per-file Python signatures, and an import
/// graph. Cache directories are excluded; unparseable files are noted and
/// skipped rather than failing the phase.
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

const CACHE_DIRS: [&str; 2] = ["__pycache__", ".pytest_cache"];

static DEF_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)def\s+(\w+)\s*\(([^)]*)\)").unwrap());
static CLASS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*class\s+(\w+)").unwrap());
static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^import\s+(.+)").unwrap());
static FROM_IMPORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^from\s+(\S+)\s+import\b").unwrap());
static HEADER_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:def|class)\s+\w+").unwrap());

/// A `def`/`class` header that never reaches its terminating `:` is a
/// truncated or broken file, typical of cut-off model output. Signatures may
/// span lines, so track bracket depth until the header's own colon shows up
/// at depth zero.
fn has_unterminated_header(source: &str) -> bool {
    for m in HEADER_START.find_iter(source) {
        let mut depth: i64 = 0;
        let mut terminated = false;
        for ch in source[m.end()..].chars() {
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                ':' if depth <= 0 => {
                    terminated = true;
                    break;
                }
                _ => {}
            }
        }
        if !terminated {
            return true;
        }
    }
    false
}

/// Generate a compressed summary of the workspace. Returns the literal
/// `(empty workspace)` when there is nothing to summarise.
pub fn summarise_codebase(workspace: &Path) -> String {
    if !workspace.exists() {
        return "(empty workspace)".to_string();
    }

    let mut files: Vec<PathBuf> = Vec::new();
    collect_files(workspace, &mut files);
    files.sort();

    if files.is_empty() {
        return "(empty workspace)".to_string();
    }

    let mut lines = vec!["# Codebase Summary\n".to_string()];

    lines.push("## File Tree".to_string());
    for f in &files {
        let rel = relative_display(f, workspace);
        let count = match std::fs::read(f) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).lines().count(),
            Err(_) => 0,
        };
        lines.push(format!("  {rel} ({count} lines)"));
    }

    let py_files: Vec<&PathBuf> = files
        .iter()
        .filter(|f| f.extension().map(|e| e == "py").unwrap_or(false))
        .collect();

    if !py_files.is_empty() {
        lines.push("\n## Python Signatures".to_string());
        for f in &py_files {
            let rel = relative_display(f, workspace);
            lines.push(format!("\n### {rel}"));
            match read_python_source(f) {
                Some(source) => {
                    if has_unterminated_header(&source) {
                        lines.push("  (syntax error -- could not parse)".to_string());
                        continue;
                    }
                    for line in source.lines() {
                        if let Some(caps) = DEF_LINE.captures(line) {
                            let args = argument_names(&caps[3]);
                            lines.push(format!("  def {}({args})", &caps[2]));
                        } else if let Some(caps) = CLASS_LINE.captures(line) {
                            lines.push(format!("  class {}", &caps[1]));
                        }
                    }
                }
                None => lines.push("  (syntax error -- could not parse)".to_string()),
            }
        }

        lines.push("\n## Imports".to_string());
        for f in &py_files {
            let rel = relative_display(f, workspace);
            let Some(source) = read_python_source(f) else { continue };
            if has_unterminated_header(&source) {
                continue;
            }
            let mut imports: Vec<String> = Vec::new();
            for line in source.lines() {
                if let Some(caps) = IMPORT_LINE.captures(line) {
                    for name in caps[1].split(',') {
                        let name = name.split_whitespace().next().unwrap_or("");
                        if !name.is_empty() {
                            imports.push(name.to_string());
                        }
                    }
                } else if let Some(caps) = FROM_IMPORT_LINE.captures(line) {
                    imports.push(caps[1].to_string());
                }
            }
            if !imports.is_empty() {
                lines.push(format!("  {rel}: {}", imports.join(", ")));
            }
        }
    }

    lines.join("\n")
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if CACHE_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

fn relative_display(path: &Path, workspace: &Path) -> String {
    path.strip_prefix(workspace)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

fn read_python_source(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Reduce a parameter list to bare argument names, dropping annotations and
/// defaults: `a: int, b=2, *args` → `a, b, *args`.
fn argument_names(params: &str) -> String {
    params
        .split(',')
        .map(|p| {
            p.trim()
                .split(':')
                .next()
                .unwrap_or("")
                .split('=')
                .next()
                .unwrap_or("")
                .trim()
        })
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
