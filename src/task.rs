/// Steering-file handling: the philosophy and task documents, scope-file
/// loading, and the append-only Domain Knowledge amendment.
///
/// The task file is the only steering file the orchestrator may rewrite,
/// and only by inserting tagged lines into its `## Domain Knowledge`
/// section.
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Longest accepted consultant addition, in chars.
pub const DK_ADDITION_MAX_CHARS: usize = 500;

/// How far the task may grow past its original size, in bytes.
pub const TASK_GROWTH_ALLOWANCE: usize = 2000;

static SCOPE_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)##[ \t]*Scope[ \t]*\n(.*?)(?:\n##|\z)").unwrap());
static SCOPE_FILE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w/\-\.]+\.(?:py|js|ts|json|yaml|yml|toml|cfg|txt|md)").unwrap()
});
static DK_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##[ \t]*Domain Knowledge[ \t]*\n").unwrap());

/// Read a file, returning an empty string when missing or unreadable.
pub fn read_file_safe(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Load the files named under the task's `## Scope` section, restricted to
/// the recognised extension set. Missing files are silently omitted.
pub fn load_scope_files(task_text: &str, workspace: &Path) -> Vec<(String, String)> {
    let Some(caps) = SCOPE_SECTION.captures(task_text) else {
        return Vec::new();
    };

    let mut files = Vec::new();
    for token in SCOPE_FILE_TOKEN.find_iter(&caps[1]) {
        let name = token.as_str();
        if files.iter().any(|(p, _)| p == name) {
            continue;
        }
        let path = workspace.join(name);
        if path.is_file() {
            files.push((name.to_string(), read_file_safe(&path)));
        }
    }
    files
}

/// Append a tagged amendment line to the task's `## Domain Knowledge`
/// section, creating the section at the end of the file when absent.
/// Pure and append-only: nothing already in the task is touched.
///
/// The addition is truncated to [`DK_ADDITION_MAX_CHARS`] before tagging;
/// the caller owns the task-size-cap check.
pub fn amend_domain_knowledge(task: &str, addition: &str, iteration: u32) -> String {
    let addition: String = addition.trim().chars().take(DK_ADDITION_MAX_CHARS).collect();
    let tagged = format!("[Auto-DK iteration {iteration}] {addition}");

    let Some(m) = DK_HEADING.find(task) else {
        let sep = if task.ends_with('\n') { "" } else { "\n" };
        return format!("{task}{sep}\n## Domain Knowledge\n{tagged}\n");
    };

    // End of the section: the next heading after it, or end of file
    let body_start = m.end();
    let insert_at = task[body_start..]
        .find("\n## ")
        .map(|i| body_start + i + 1)
        .unwrap_or(task.len());

    let mut out = String::with_capacity(task.len() + tagged.len() + 2);
    out.push_str(&task[..insert_at]);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&tagged);
    out.push('\n');
    out.push_str(&task[insert_at..]);
    out
}
