/// Command sandboxing: write-path confinement, sudo allowlist, foreground
/// blocking.
///
/// The regex-based write-target extraction is best-effort -- it cannot handle
/// arbitrary quoting, subshells, or `eval`. It is layered with the
/// workspace-as-cwd confinement in `Executor::execute`; neither alone is
/// sufficient, and the second layer must never be weakened.
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::RunConfig;
use crate::logger::Logger;

/// Per-stream cap on captured subprocess output.
const MAX_STREAM_BYTES: usize = 8000;

/// Sudo subcommands that are safe for unattended use. Anything not on this
/// list gets blocked.
const SUDO_ALLOWLIST: [&str; 13] = [
    "apt", "apt-get", "dpkg", "systemctl", "service", "kill", "killall", "pkill", "lsof", "fuser",
    "ufw", "netstat", "ss",
];

/// Commands and patterns that run forever or require interactive input.
/// Blocked unconditionally; the block reason names the matched pattern.
const FOREGROUND_PATTERNS: [&str; 17] = [
    r"\btail\s+-f\b",
    r"\bwatch\b",
    r"\bpython\s+-m\s+http\.server\b",
    r"\bnpm\s+run\s+dev\b",
    r"\bnpm\s+start\b",
    r"\bnode\s+.*--watch\b",
    r"\bflask\s+run\b",
    r"\buvicorn\b",
    r"\bgunicorn\b",
    r"\bjupyter\b",
    r"\bless\b",
    r"\bmore\b",
    r"\bvi\b",
    r"\bvim\b",
    r"\bnano\b",
    r"\btop\b",
    r"\bhtop\b",
];

static FOREGROUND: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    FOREGROUND_PATTERNS
        .iter()
        .map(|p| (*p, Regex::new(p).unwrap()))
        .collect()
});

/// Shell operators and commands that produce file output. Redirects to
/// /dev/null pass the indicator but are whitelisted at the target check.
static WRITE_INDICATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)(?:
          >                                          # any redirect
        | \btee\s
        | \bmv\s | \bcp\s
        | \brm\s | \brmdir\s
        | \bmkdir\s
        | \btouch\s
        | \bchmod\s | \bchown\s
        | \bln\s
        | \binstall\s
        | \bdd\s
        | \bwget\s | \bcurl\s.*-o                    # download to file
        )",
    )
    .unwrap()
});

static SUDO_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^sudo\s+(\S+)").unwrap());
static REDIRECT_TARGET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">{1,2}\s*(\S+)").unwrap());
static TEE_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\btee\s+(?:-a\s+)?(\S+)").unwrap());
static FILE_CMD_TARGETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:rm|mv|cp|mkdir|touch|chmod|chown|ln)\s+(.+?)(?:\s*[;&|]|$)").unwrap()
});
static DOWNLOAD_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:wget\s+.*-O|curl\s+.*-o)\s*(\S+)").unwrap());
static OUTPUT_FLAG_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:-o|--output)\s+(\S+)").unwrap());

/// Commands that legitimately take minutes get the long timeout.
const INSTALL_MARKERS: [&str; 4] = ["apt install", "pip install", "npm install", "cargo build"];

// ── Write-target extraction ───────────────────────────────────────────────────

/// Best-effort extraction of paths a command might write to.
fn resolve_write_targets(cmd: &str) -> Vec<String> {
    let mut targets = Vec::new();

    for caps in REDIRECT_TARGET.captures_iter(cmd) {
        targets.push(caps[1].to_string());
    }
    for caps in TEE_TARGET.captures_iter(cmd) {
        targets.push(caps[1].to_string());
    }
    for caps in FILE_CMD_TARGETS.captures_iter(cmd) {
        // all non-flag tokens are potential targets
        for token in caps[1].split_whitespace() {
            if !token.starts_with('-') {
                targets.push(token.to_string());
            }
        }
    }
    for caps in DOWNLOAD_TARGET.captures_iter(cmd) {
        targets.push(caps[1].to_string());
    }
    for caps in OUTPUT_FLAG_TARGET.captures_iter(cmd) {
        targets.push(caps[1].to_string());
    }

    targets
}

// ── Path containment ──────────────────────────────────────────────────────────

/// Resolve a path, following symlinks for every prefix that exists and
/// applying `.`/`..` lexically past the first component that does not.
fn resolve_path(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
        if let Ok(canon) = resolved.canonicalize() {
            resolved = canon;
        }
    }
    resolved
}

/// Check whether a write target resolves inside the workspace. Containment
/// is compared per path component, so a sibling like `/ws2` is never
/// mistaken for being inside `/ws`.
fn is_inside_workspace(target: &str, workspace: &Path) -> bool {
    if matches!(target.trim(), "/dev/null" | "NUL" | "nul") {
        return true;
    }
    let joined = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        workspace.join(target)
    };
    let resolved = resolve_path(&joined);
    let ws = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    resolved.starts_with(&ws)
}

// ── The check ─────────────────────────────────────────────────────────────────

/// Decide whether a command is safe to execute. Returns `None` if OK, or a
/// human-readable block reason. Three gates, applied in order: foreground
/// detection, sudo allowlist, write-path confinement.
pub fn sandbox_check(cmd: &str, workspace: &Path) -> Option<String> {
    let stripped = cmd.trim();

    // 1. Foreground / interactive process detection
    for (pattern, re) in FOREGROUND.iter() {
        if re.is_match(stripped) {
            return Some(format!(
                "BLOCKED: Foreground/interactive process detected ({pattern}). \
                 Rewrite as a one-shot command or background with timeout."
            ));
        }
    }

    // 2. Sudo allowlist
    if let Some(caps) = SUDO_PREFIX.captures(stripped) {
        let subcmd = caps[1].rsplit('/').next().unwrap_or(&caps[1]).to_string();
        if !SUDO_ALLOWLIST.contains(&subcmd.as_str()) {
            let mut allowed = SUDO_ALLOWLIST.to_vec();
            allowed.sort_unstable();
            return Some(format!(
                "BLOCKED: sudo {subcmd} is not on the allowed list. \
                 Allowed sudo commands: {}",
                allowed.join(", ")
            ));
        }
        // Allowlisted sudo may write to system paths (apt, systemctl) -- only
        // file-manipulation subcommands get the workspace target check.
        let inner = stripped
            .find(&subcmd)
            .map(|i| &stripped[i..])
            .unwrap_or(stripped);
        let manipulates_files = ["rm ", "mv ", "cp ", "chmod ", "chown "]
            .iter()
            .any(|op| inner.contains(op));
        if manipulates_files {
            for target in resolve_write_targets(inner) {
                if !is_inside_workspace(&target, workspace) {
                    return Some(format!(
                        "BLOCKED: sudo command writes outside workspace: {target}"
                    ));
                }
            }
        }
        return None;
    }

    // 3. Write-path confinement (non-sudo commands)
    if WRITE_INDICATORS.is_match(stripped) {
        for target in resolve_write_targets(stripped) {
            if !is_inside_workspace(&target, workspace) {
                return Some(format!(
                    "BLOCKED: Command writes outside workspace: {target}. \
                     All file modifications must target paths within {}",
                    workspace.display()
                ));
            }
        }
    }

    None
}

// ── Executor ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    pub timed_out: bool,
}

impl CommandResult {
    fn blocked(reason: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason,
            returncode: -1,
            timed_out: false,
        }
    }
}

pub struct Executor {
    workspace: PathBuf,
    timeout_default: u64,
    timeout_install: u64,
}

impl Executor {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            workspace: config.workspace.clone(),
            timeout_default: config.cmd_timeout_default,
            timeout_install: config.cmd_timeout_install,
        }
    }

    /// Execute a shell command with sandboxing. A block is surfaced as a
    /// synthetic failed result (`returncode = -1`, reason as stderr) so the
    /// model can adapt on the next iteration -- never as an error.
    pub async fn execute(&self, cmd: &str, logger: &Logger) -> CommandResult {
        if let Some(reason) = sandbox_check(cmd, &self.workspace) {
            logger.log(&format!("  {reason}"));
            logger.bell();
            return CommandResult::blocked(reason);
        }

        let secs = if INSTALL_MARKERS.iter().any(|m| cmd.contains(m)) {
            self.timeout_install
        } else {
            self.timeout_default
        };
        logger.log(&format!("  EXEC: {cmd} (timeout={secs}s)"));

        let fut = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.workspace)
            .output();

        match timeout(Duration::from_secs(secs), fut).await {
            Ok(Ok(output)) => CommandResult {
                stdout: truncate_stream(&output.stdout),
                stderr: truncate_stream(&output.stderr),
                returncode: output.status.code().unwrap_or(-1),
                timed_out: false,
            },
            Ok(Err(e)) => CommandResult {
                stdout: String::new(),
                stderr: e.to_string(),
                returncode: -1,
                timed_out: false,
            },
            Err(_) => CommandResult {
                stdout: String::new(),
                stderr: format!("Command timed out after {secs}s"),
                returncode: -1,
                timed_out: true,
            },
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

fn truncate_stream(bytes: &[u8]) -> String {
    let cut = &bytes[..bytes.len().min(MAX_STREAM_BYTES)];
    String::from_utf8_lossy(cut).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, RunConfig};
    use crate::logger::Logger;

    fn ws() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn executor_for(dir: &Path) -> Executor {
        let cfg = RunConfig::resolve(
            &ConfigFile::default(),
            dir.parent().unwrap(),
            None,
            None,
            Some(dir.to_str().unwrap()),
            None,
        );
        Executor::new(&cfg)
    }

    // ── sandbox_check: foreground gate ────────────────────────────────────────

    #[test]
    fn test_foreground_patterns_blocked_with_pattern_cited() {
        let dir = ws();
        for cmd in [
            "tail -f app.log",
            "watch date",
            "python -m http.server 8080",
            "npm run dev",
            "flask run",
            "uvicorn app:app",
            "vim notes.txt",
            "top",
        ] {
            let reason = sandbox_check(cmd, dir.path());
            let reason = reason.unwrap_or_else(|| panic!("{cmd} was not blocked"));
            assert!(reason.contains("Foreground/interactive"), "{cmd}: {reason}");
            assert!(reason.contains("\\b"), "reason should cite the pattern: {reason}");
        }
    }

    // ── sandbox_check: sudo gate ──────────────────────────────────────────────

    #[test]
    fn test_sudo_outside_allowlist_blocked() {
        let dir = ws();
        for cmd in ["sudo bash -c 'echo hi'", "sudo python x.py", "sudo /usr/bin/make install"] {
            let reason = sandbox_check(cmd, dir.path()).unwrap();
            assert!(reason.contains("not on the allowed list"), "{cmd}: {reason}");
        }
    }

    #[test]
    fn test_sudo_allowlist_accepts_basename() {
        let dir = ws();
        assert_eq!(sandbox_check("sudo apt-get update", dir.path()), None);
        assert_eq!(sandbox_check("sudo /usr/bin/apt install -y jq", dir.path()), None);
        assert_eq!(sandbox_check("sudo systemctl status nginx", dir.path()), None);
        assert_eq!(sandbox_check("sudo kill 1234", dir.path()), None);
    }

    #[test]
    fn test_sudo_file_manipulation_outside_workspace_blocked() {
        let dir = ws();
        // an allowlisted sudo word must not smuggle an rm past the target check
        let reason =
            sandbox_check("sudo killall -9 python; sudo rm -rf /etc", dir.path()).unwrap();
        assert!(reason.contains("writes outside workspace"));
        let reason =
            sandbox_check("sudo apt-get install x && rm -rf /etc/nginx", dir.path()).unwrap();
        assert!(reason.contains("/etc/nginx"));
    }

    // ── sandbox_check: write-path gate ────────────────────────────────────────

    #[test]
    fn test_harmless_commands_pass() {
        let dir = ws();
        for cmd in ["echo hi", "python script.py", "cat file", "ls"] {
            assert_eq!(sandbox_check(cmd, dir.path()), None, "{cmd} wrongly blocked");
        }
    }

    #[test]
    fn test_dev_null_redirect_allowed() {
        let dir = ws();
        assert_eq!(sandbox_check("echo x > /dev/null", dir.path()), None);
    }

    #[test]
    fn test_redirect_outside_workspace_blocked() {
        let dir = ws();
        let reason = sandbox_check("echo pwned > /tmp/pwned.txt", dir.path()).unwrap();
        assert!(reason.contains("writes outside workspace"));
        assert!(reason.contains("/tmp/pwned.txt"));
    }

    #[test]
    fn test_redirect_inside_workspace_allowed() {
        let dir = ws();
        assert_eq!(sandbox_check("echo data > out.txt", dir.path()), None);
        assert_eq!(sandbox_check("mkdir pkg && touch pkg/__init__.py", dir.path()), None);
    }

    #[test]
    fn test_rm_outside_workspace_blocked() {
        let dir = ws();
        let reason = sandbox_check("rm -rf /tmp/data", dir.path()).unwrap();
        assert!(reason.contains("/tmp/data"));
    }

    #[test]
    fn test_parent_escape_blocked() {
        let dir = ws();
        let reason = sandbox_check("cp secrets.txt ../outside.txt", dir.path());
        assert!(reason.is_some());
    }

    #[test]
    fn test_sibling_directory_is_not_inside() {
        // /ws vs /ws2: containment must compare components, not string prefixes
        let root = tempfile::tempdir().unwrap();
        let ws_dir = root.path().join("ws");
        let sibling = root.path().join("ws2");
        std::fs::create_dir(&ws_dir).unwrap();
        std::fs::create_dir(&sibling).unwrap();

        assert!(!is_inside_workspace(sibling.to_str().unwrap(), &ws_dir));
        assert!(!is_inside_workspace("../ws2/x.txt", &ws_dir));
        assert!(is_inside_workspace("sub/x.txt", &ws_dir));
    }

    #[test]
    fn test_resolve_path_applies_parent_components() {
        let root = tempfile::tempdir().unwrap();
        let ws_dir = root.path().join("ws");
        std::fs::create_dir(&ws_dir).unwrap();
        let resolved = resolve_path(&ws_dir.join("a/../../escape.txt"));
        assert!(!resolved.starts_with(ws_dir.canonicalize().unwrap()));
    }

    #[test]
    fn test_resolve_write_targets_extraction() {
        let targets = resolve_write_targets("python x.py > out.log 2>&1");
        assert!(targets.contains(&"out.log".to_string()));
        let targets = resolve_write_targets("cat a | tee -a log.txt");
        assert!(targets.contains(&"log.txt".to_string()));
        let targets = resolve_write_targets("curl https://x.test -o dump.bin");
        assert!(targets.contains(&"dump.bin".to_string()));
        let targets = resolve_write_targets("mv old.py new.py");
        assert_eq!(targets, vec!["old.py", "new.py"]);
    }

    // ── execute ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_execute_captures_output() {
        let dir = ws();
        let exec = executor_for(dir.path());
        let logger = Logger::console_only();
        let result = exec.execute("echo hi", &logger).await;
        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout.trim(), "hi");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_execute_blocked_returns_synthetic_failure() {
        let dir = ws();
        let exec = executor_for(dir.path());
        let logger = Logger::console_only();
        let result = exec.execute("rm -rf /tmp/data", &logger).await;
        assert_eq!(result.returncode, -1);
        assert!(!result.timed_out);
        assert!(result.stderr.contains("BLOCKED"));
    }

    #[tokio::test]
    async fn test_execute_runs_in_workspace_cwd() {
        let dir = ws();
        let exec = executor_for(dir.path());
        let logger = Logger::console_only();
        let result = exec.execute("pwd", &logger).await;
        let reported = PathBuf::from(result.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_is_reported_not_fatal() {
        let dir = ws();
        let exec = executor_for(dir.path());
        let logger = Logger::console_only();
        let result = exec.execute("sh -c 'exit 3'", &logger).await;
        assert_eq!(result.returncode, 3);
    }
}
