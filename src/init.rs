/// `init <dir>` -- one-shot project scaffolding.
///
/// Creates the steering-file skeleton a run needs: philosophy, task, a
/// starter config, an ignore file, and an empty workspace. Refuses to touch
/// a directory that already exists.
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

const PHILOSOPHY_TEMPLATE: &str = r#"Write boring, obvious Python. Prefer the standard library over
dependencies. Small functions, clear names, no cleverness. Handle the
error cases the tests name and no others. When in doubt, do the simplest
thing that makes the tests pass.
"#;

const TASK_TEMPLATE: &str = r#"# Task

Describe the goal here in one or two sentences.

## Scope

List the workspace files involved, one per line (e.g. calculator.py).

## Constraints

- stdlib + pytest only
- No network access

## Domain Knowledge

State the facts about the problem domain the models cannot guess.
Automatic amendments are appended here when the loop stalls.
"#;

const GITIGNORE_TEMPLATE: &str = r#"workspace/__pycache__/
workspace/.pytest_cache/
redgreen.log
"#;

const CONFIG_TEMPLATE: &str = r#"# redgreen configuration (optional -- every key has a default)
# CLI flags override this file; this file overrides the defaults.

# OpenAI-compatible endpoint (LM Studio default shown)
# url = "http://localhost:1234/v1"

# ── Role -> model bindings ────────────────────────────────────────────────────
# A single-model deployment may set only the implementer; the consultant
# defaults to the planner model.
# [models]
# planner     = "mistralai_ministral-3-14b-reasoning-2512"
# implementer = "mistralai_devstral-small-2-24b-instruct-2512"
# consultant  = "mistralai_ministral-3-14b-reasoning-2512"

# ── Sampling profile overrides ────────────────────────────────────────────────
# Recognised profiles: planner, implementer, conservative, consultant.
# Unset fields keep the built-in values.
# [profiles.implementer]
# temperature       = 0.15
# top_p             = 1.0
# top_k             = 25
# min_p             = 0.05
# repeat_penalty    = 1.05
# max_output_tokens = 4096
"#;

/// Scaffold a new project directory. Fails if `dir` already exists.
pub fn scaffold(dir: &Path) -> Result<()> {
    if dir.exists() {
        bail!("{} already exists -- refusing to overwrite", dir.display());
    }

    fs::create_dir_all(dir.join("workspace"))
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(dir.join("philosophy.md"), PHILOSOPHY_TEMPLATE)?;
    fs::write(dir.join("task.md"), TASK_TEMPLATE)?;
    fs::write(dir.join(".gitignore"), GITIGNORE_TEMPLATE)?;
    fs::write(dir.join("redgreen.toml"), CONFIG_TEMPLATE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_creates_project_skeleton() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("proj");
        scaffold(&dir).unwrap();

        assert!(dir.join("workspace").is_dir());
        assert!(dir.join("philosophy.md").is_file());
        assert!(dir.join("redgreen.toml").is_file());
        assert!(dir.join(".gitignore").is_file());

        let task = std::fs::read_to_string(dir.join("task.md")).unwrap();
        assert!(task.contains("## Scope"));
        assert!(task.contains("## Constraints"));
        // Domain Knowledge last, so amendments grow at the end of the file
        assert!(task.trim_end().ends_with("Automatic amendments are appended here when the loop stalls."));
    }

    #[test]
    fn test_scaffold_refuses_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let err = scaffold(root.path()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_scaffolded_config_parses() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("proj");
        scaffold(&dir).unwrap();
        let file = crate::config::ConfigFile::load(&dir).unwrap();
        // everything is commented out -- defaults apply
        assert!(file.url.is_none());
        assert!(file.profiles.is_empty());
    }

    #[test]
    fn test_scaffolded_workspace_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("proj");
        scaffold(&dir).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.join("workspace")).unwrap().collect();
        assert!(entries.is_empty());
    }
}
