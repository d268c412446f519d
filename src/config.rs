use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// ── Roles ─────────────────────────────────────────────────────────────────────

/// A logical function the controller wants filled. Each role is bound to a
/// concrete model id; single- and dual-model deployments differ only in
/// whether those ids coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Planner,
    Implementer,
    Consultant,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Implementer => "implementer",
            Role::Consultant => "consultant",
        }
    }
}

// ── Sampling profiles ─────────────────────────────────────────────────────────

/// A named bundle of sampling parameters for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub min_p: f64,
    pub repeat_penalty: f64,
    pub max_output_tokens: u32,
}

/// The four recognised profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileName {
    /// Hotter, exploratory -- test design and planning below stress.
    Planner,
    /// Cooler, code-focused -- the implement phase.
    Implementer,
    /// Tightest sampling -- escalated audit/review calls.
    Conservative,
    /// Medium temperature, large output budget -- planning and DK consults.
    Consultant,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Planner => "planner",
            ProfileName::Implementer => "implementer",
            ProfileName::Conservative => "conservative",
            ProfileName::Consultant => "consultant",
        }
    }
}

/// All four profiles, overridable per-name from `redgreen.toml`.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    pub planner: Profile,
    pub implementer: Profile,
    pub conservative: Profile,
    pub consultant: Profile,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            planner: Profile {
                temperature: 0.7,
                top_p: 0.95,
                top_k: 50,
                min_p: 0.05,
                repeat_penalty: 1.1,
                max_output_tokens: 4096,
            },
            implementer: Profile {
                temperature: 0.15,
                top_p: 1.0,
                top_k: 25,
                min_p: 0.05,
                repeat_penalty: 1.05,
                max_output_tokens: 4096,
            },
            conservative: Profile {
                temperature: 0.05,
                top_p: 0.9,
                top_k: 10,
                min_p: 0.1,
                repeat_penalty: 1.0,
                max_output_tokens: 4096,
            },
            consultant: Profile {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                min_p: 0.05,
                repeat_penalty: 1.05,
                max_output_tokens: 8192,
            },
        }
    }
}

impl ProfileTable {
    pub fn get(&self, name: ProfileName) -> &Profile {
        match name {
            ProfileName::Planner => &self.planner,
            ProfileName::Implementer => &self.implementer,
            ProfileName::Conservative => &self.conservative,
            ProfileName::Consultant => &self.consultant,
        }
    }
}

// ── Config file (redgreen.toml in the project directory) ──────────────────────

/// Partial profile override -- unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileOverride {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

impl ProfileOverride {
    fn apply(&self, base: &mut Profile) {
        if let Some(v) = self.temperature {
            base.temperature = v;
        }
        if let Some(v) = self.top_p {
            base.top_p = v;
        }
        if let Some(v) = self.top_k {
            base.top_k = v;
        }
        if let Some(v) = self.min_p {
            base.min_p = v;
        }
        if let Some(v) = self.repeat_penalty {
            base.repeat_penalty = v;
        }
        if let Some(v) = self.max_output_tokens {
            base.max_output_tokens = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsSection {
    pub planner: Option<String>,
    pub implementer: Option<String>,
    pub consultant: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// OpenAI-compatible endpoint base URL
    pub url: Option<String>,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverride>,
}

impl ConfigFile {
    /// Load `redgreen.toml` from the project dir, or defaults if absent.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("redgreen.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

/// The one configuration record for a run, threaded into every component at
/// construction. There is no global config.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// OpenAI-compatible endpoint base URL, e.g. "http://localhost:1234/v1"
    pub endpoint: String,
    pub planner_model: String,
    pub implementer_model: String,
    pub consultant_model: String,
    pub project_dir: PathBuf,
    pub task_path: PathBuf,
    pub philosophy_path: PathBuf,
    pub workspace: PathBuf,
    pub profiles: ProfileTable,
    /// Context budget for planner/implementer calls, in tokens
    pub context_tokens: u32,
    /// Context budget for consultant calls, in tokens
    pub consultant_context_tokens: u32,
    /// Subprocess timeout in seconds for ordinary commands
    pub cmd_timeout_default: u64,
    /// Subprocess timeout in seconds for install-class commands
    pub cmd_timeout_install: u64,
}

const DEFAULT_ENDPOINT: &str = "http://localhost:1234/v1";
const DEFAULT_PLANNER_MODEL: &str = "mistralai_ministral-3-14b-reasoning-2512";
const DEFAULT_IMPLEMENTER_MODEL: &str = "mistralai_devstral-small-2-24b-instruct-2512";

impl RunConfig {
    /// Merge config file with CLI overrides.
    /// Priority: CLI args > redgreen.toml > built-in defaults.
    pub fn resolve(
        file: &ConfigFile,
        project_dir: &Path,
        task_override: Option<&str>,
        philosophy_override: Option<&str>,
        workspace_override: Option<&str>,
        url_override: Option<&str>,
    ) -> Self {
        let endpoint = url_override
            .map(str::to_string)
            .or_else(|| file.url.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let planner_model = file
            .models
            .planner
            .clone()
            .unwrap_or_else(|| DEFAULT_PLANNER_MODEL.to_string());
        let implementer_model = file
            .models
            .implementer
            .clone()
            .unwrap_or_else(|| DEFAULT_IMPLEMENTER_MODEL.to_string());
        // The consultant defaults to the planner model -- the highest-capability
        // model already present on a single-box deployment.
        let consultant_model = file
            .models
            .consultant
            .clone()
            .unwrap_or_else(|| planner_model.clone());

        let mut profiles = ProfileTable::default();
        for (name, over) in &file.profiles {
            match name.as_str() {
                "planner" => over.apply(&mut profiles.planner),
                "implementer" => over.apply(&mut profiles.implementer),
                "conservative" => over.apply(&mut profiles.conservative),
                "consultant" => over.apply(&mut profiles.consultant),
                _ => {} // unknown profile names are ignored
            }
        }

        let task_path = project_dir.join(task_override.unwrap_or("task.md"));
        let philosophy_path = project_dir.join(philosophy_override.unwrap_or("philosophy.md"));
        let workspace = workspace_override
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dir.join("workspace"));

        Self {
            endpoint,
            planner_model,
            implementer_model,
            consultant_model,
            project_dir: project_dir.to_path_buf(),
            task_path,
            philosophy_path,
            workspace,
            profiles,
            context_tokens: 16_384,
            consultant_context_tokens: 61_440,
            cmd_timeout_default: 30,
            cmd_timeout_install: 300,
        }
    }

    /// Model id bound to a role.
    pub fn model_for(&self, role: Role) -> &str {
        match role {
            Role::Planner => &self.planner_model,
            Role::Implementer => &self.implementer_model,
            Role::Consultant => &self.consultant_model,
        }
    }

    /// Context budget for a role. The consultant gets the large window; the
    /// assembler owns enforcement.
    pub fn context_budget_for(&self, role: Role) -> u32 {
        match role {
            Role::Consultant => self.consultant_context_tokens,
            _ => self.context_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_cover_all_four_names() {
        let table = ProfileTable::default();
        for name in [
            ProfileName::Planner,
            ProfileName::Implementer,
            ProfileName::Conservative,
            ProfileName::Consultant,
        ] {
            let p = table.get(name);
            assert!(p.temperature >= 0.0);
            assert!(p.max_output_tokens > 0);
        }
    }

    #[test]
    fn test_planner_hotter_than_implementer_than_conservative() {
        let table = ProfileTable::default();
        assert!(table.planner.temperature > table.implementer.temperature);
        assert!(table.implementer.temperature > table.conservative.temperature);
    }

    #[test]
    fn test_consultant_has_largest_output_budget() {
        let table = ProfileTable::default();
        assert!(table.consultant.max_output_tokens > table.planner.max_output_tokens);
    }

    #[test]
    fn test_resolve_defaults() {
        let cfg = RunConfig::resolve(
            &ConfigFile::default(),
            Path::new("/proj"),
            None,
            None,
            None,
            None,
        );
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.task_path, PathBuf::from("/proj/task.md"));
        assert_eq!(cfg.philosophy_path, PathBuf::from("/proj/philosophy.md"));
        assert_eq!(cfg.workspace, PathBuf::from("/proj/workspace"));
        // consultant falls back to the planner model
        assert_eq!(cfg.consultant_model, cfg.planner_model);
        assert_eq!(cfg.context_budget_for(Role::Planner), 16_384);
        assert_eq!(cfg.context_budget_for(Role::Implementer), 16_384);
        assert_eq!(cfg.context_budget_for(Role::Consultant), 61_440);
    }

    #[test]
    fn test_resolve_cli_overrides_win() {
        let file = ConfigFile {
            url: Some("http://filehost:1234/v1".to_string()),
            ..Default::default()
        };
        let cfg = RunConfig::resolve(
            &file,
            Path::new("/proj"),
            Some("other-task.md"),
            None,
            Some("/elsewhere/ws"),
            Some("http://clihost:5000/v1"),
        );
        assert_eq!(cfg.endpoint, "http://clihost:5000/v1");
        assert_eq!(cfg.task_path, PathBuf::from("/proj/other-task.md"));
        assert_eq!(cfg.workspace, PathBuf::from("/elsewhere/ws"));
    }

    #[test]
    fn test_config_file_parse_with_profile_override() {
        let raw = r#"
url = "http://box:1234/v1"

[models]
planner = "big-reasoner"
implementer = "code-model"

[profiles.implementer]
temperature = 0.05
max_output_tokens = 2048
"#;
        let file: ConfigFile = toml::from_str(raw).unwrap();
        let cfg = RunConfig::resolve(&file, Path::new("/p"), None, None, None, None);
        assert_eq!(cfg.endpoint, "http://box:1234/v1");
        assert_eq!(cfg.planner_model, "big-reasoner");
        assert_eq!(cfg.consultant_model, "big-reasoner");
        assert_eq!(cfg.profiles.implementer.temperature, 0.05);
        assert_eq!(cfg.profiles.implementer.max_output_tokens, 2048);
        // untouched fields keep built-ins
        assert_eq!(cfg.profiles.implementer.top_k, 25);
    }
}
