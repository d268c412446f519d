/// Prompt assembly for each controller phase, under a per-role token budget.
///
/// Budgets are enforced here and nowhere else: when a combined prompt would
/// overflow the role's context window, the user text is right-truncated with
/// an explicit marker. System text is never truncated.
use crate::parser::PlanEntry;

pub const TRUNCATION_MARKER: &str = "[...truncated to fit context window...]";

/// Failure lines carried into the implement prompt, at most.
const FAILURE_LINES_MAX: usize = 30;

/// Test output carried into the DK consult, at most (chars).
const DK_OUTPUT_MAX_CHARS: usize = 6000;

/// Headroom reserved when truncating the user prompt, in tokens.
const TRUNCATION_RESERVE_TOKENS: usize = 500;

// ── Token estimation ──────────────────────────────────────────────────────────

/// Rough token count, ~3 chars per token for English/code. Logged by the
/// client, enforced by the assembler.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 3
}

/// Right-truncate to an approximate token limit, marking the cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 3;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}\n\n{TRUNCATION_MARKER}")
}

// ── Failure-line filters ──────────────────────────────────────────────────────

/// Pick the lines of a pytest run worth repeating to the implementer:
/// failures, errors, assertion context.
pub fn extract_failure_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| {
            l.contains("FAILED")
                || l.contains("Error")
                || l.to_lowercase().contains("assert")
                || l.trim_start().starts_with("E ")
                || l.trim_start().starts_with('>')
        })
        .take(FAILURE_LINES_MAX)
        .map(str::to_string)
        .collect()
}

/// The assertion-diagnostic subset shown to the DK consultant.
pub fn assertion_diagnostics(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.trim_start().starts_with("E ") || l.to_lowercase().contains("assert"))
        .map(str::to_string)
        .collect()
}

// ── Phase system prompts ──────────────────────────────────────────────────────

const PLAN_PROMPT: &str = r#"You are the planning model in a TDD pipeline. Your job:
1. Analyse the task against the current codebase.
2. Write pytest test functions FIRST that define the expected behaviour.
   Tests must be runnable independently. Use only stdlib + pytest.
3. Then write an implementation plan: which files to create/modify,
   function signatures, and pseudocode per function.

Output format (strict -- the orchestrator parses this):

{
  "tests": {
    "filename": "test_<module>.py",
    "content": "<full pytest file content>"
  },
  "plan": [
    {
      "file": "path/to/file.py",
      "action": "create|modify",
      "functions": [
        {
          "name": "function_name",
          "signature": "def function_name(arg1: type, arg2: type) -> return_type",
          "pseudocode": "Brief description of what this function does"
        }
      ]
    }
  ]
}

Do not write implementation code. Only tests and the plan.
Do not invent libraries or APIs not mentioned in Domain Knowledge.
Output ONLY the JSON object. No markdown fences. No preamble."#;

const IMPLEMENT_PROMPT: &str = r#"You are the implementation model. You receive a plan with function
signatures and pseudocode. Your job:
1. Implement each function according to the plan.
2. Output the complete modified file contents.
3. Do not modify function signatures from the plan.
4. Do not add functions not in the plan.

For each file, output a file block:

===FILE: path/to/file.py===
<complete file content>
===END FILE===

If you need to run a shell command (e.g., install a dependency), output:

===CMD===
<command>
===END CMD===

Output ONLY file blocks and command blocks. No explanations."#;

const AUDIT_PROMPT: &str = r#"Tests are failing. Audit the TEST SUITE, not the implementation.
Your job:
1. Check each FAILING test against the task's Domain Knowledge section.
2. Decide whether any failing test asserts behaviour the task does not
   actually require, or contradicts Domain Knowledge.
3. If every failing test is legitimate, say so and change nothing.

Output format:
{
  "tests_correct": true|false,
  "issues": "What is wrong with the tests, or empty",
  "tests": { "filename": "...", "content": "<full corrected pytest file>" }
}

Include "tests" ONLY if tests_correct is false. The corrected file must keep
every test function the original suite had -- fix tests, never delete them.
Output ONLY the JSON object. No markdown fences. No preamble."#;

const REVIEW_PROMPT: &str = r#"Tests are failing and the tests themselves have been audited as correct.
Your job:
1. Analyse the test failures against the implementation.
2. Identify the root cause of EACH failure.
3. Write a corrected implementation plan addressing ONLY the failures.
   Do not rewrite parts that are working.
4. Where you know the exact fix, attach a "code" field to the plan entry
   with the full corrected function.

Output format:
{
  "plan": [
    {
      "file": "path/to/file.py",
      "action": "modify",
      "description": "what is being fixed",
      "code": "<corrected function, optional>"
    }
  ],
  "diagnosis": "Brief explanation of what went wrong"
}

Output ONLY the JSON object. No markdown fences. No preamble."#;

const DK_PING_PROMPT: &str = r#"An automated TDD loop has stalled: the same tests have been failing for
several iterations and the implementation model cannot break out. You are
the escalation consultant. Your job:
1. Read the failing tests and the implementation.
2. Diagnose what understanding is MISSING from the task's Domain Knowledge
   section that would explain the repeated failures.
3. Propose one short factual addition to Domain Knowledge that unblocks the
   implementer. State facts about the problem domain, not code edits.

Output format:
{
  "diagnosis": "What the implementation keeps getting wrong",
  "dk_addition": "One short factual statement to append to Domain Knowledge (max 500 characters)",
  "confidence": "high|medium|low"
}

Use confidence "low" if you cannot tell what is missing -- the loop halts
rather than amending the task with a guess.
Output ONLY the JSON object. No markdown fences. No preamble."#;

// ── Assembler ─────────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    philosophy: String,
}

impl ContextAssembler {
    pub fn new(philosophy: String) -> Self {
        Self { philosophy }
    }

    fn system_for(&self, role_prompt: &str) -> String {
        format!("{}\n\n{role_prompt}", self.philosophy)
    }

    /// Enforce the role budget: right-truncate the user text, never the
    /// system text.
    fn fit(&self, system: String, user: String, budget_tokens: u32) -> (String, String) {
        let total = estimate_tokens(&system) + estimate_tokens(&user);
        if total <= budget_tokens as usize {
            return (system, user);
        }
        let user_budget = (budget_tokens as usize)
            .saturating_sub(estimate_tokens(&system) + TRUNCATION_RESERVE_TOKENS);
        let user = truncate_to_tokens(&user, user_budget);
        (system, user)
    }

    /// PLAN phase: task + codebase summary + scope file contents.
    pub fn plan_context(
        &self,
        task: &str,
        codebase_summary: &str,
        scope_files: &[(String, String)],
        budget_tokens: u32,
    ) -> (String, String) {
        let system = self.system_for(PLAN_PROMPT);

        let mut parts = vec![task.to_string(), "---".to_string(), codebase_summary.to_string()];
        if !scope_files.is_empty() {
            parts.push("---\n## Scope File Contents".to_string());
            for (path, content) in scope_files {
                parts.push(format!("\n### {path}\n```\n{content}\n```"));
            }
        }

        self.fit(system, parts.join("\n\n"), budget_tokens)
    }

    /// IMPLEMENT phase: plan + carried review feedback, in fixed order.
    /// Omitted sections leave no trace.
    #[allow(clippy::too_many_arguments)]
    pub fn implement_context(
        &self,
        task: &str,
        plan: &[PlanEntry],
        current_files: &[(String, String)],
        diagnosis: &str,
        test_output: &str,
        review_code: &str,
        stuck_hint: &str,
        budget_tokens: u32,
    ) -> (String, String) {
        let system = self.system_for(IMPLEMENT_PROMPT);

        let plan_text = serde_json::to_string_pretty(plan).unwrap_or_default();
        let mut parts = vec![
            task.to_string(),
            format!("---\n## Implementation Plan\n{plan_text}"),
        ];

        if !diagnosis.is_empty() {
            parts.push(format!(
                "---\n## Previous Attempt Failed\nThe previous implementation had these issues:\n{diagnosis}"
            ));
        }
        if !test_output.is_empty() {
            let fail_lines = extract_failure_lines(test_output);
            if !fail_lines.is_empty() {
                parts.push(format!(
                    "---\n## Test Failures\n```\n{}\n```",
                    fail_lines.join("\n")
                ));
            }
        }
        if !review_code.is_empty() {
            parts.push(format!(
                "---\n## Corrected Functions From Review\nUse these EXACT implementations in your output:\n```\n{review_code}\n```"
            ));
        }
        if !stuck_hint.is_empty() {
            parts.push(format!("---\n## IMPORTANT\n{stuck_hint}"));
        }
        if !current_files.is_empty() {
            parts.push("---\n## Current File Contents".to_string());
            for (path, content) in current_files {
                parts.push(format!("\n### {path}\n```\n{content}\n```"));
            }
        }

        self.fit(system, parts.join("\n\n"), budget_tokens)
    }

    /// TEST AUDIT phase (5A): is any failing test itself wrong?
    pub fn audit_context(
        &self,
        task: &str,
        test_content: &str,
        test_output: &str,
        budget_tokens: u32,
    ) -> (String, String) {
        let system = self.system_for(AUDIT_PROMPT);
        let user = [
            task.to_string(),
            format!("---\n## Test File\n```\n{test_content}\n```"),
            format!("---\n## Test Output (failures)\n```\n{test_output}\n```"),
        ]
        .join("\n\n");
        self.fit(system, user, budget_tokens)
    }

    /// IMPLEMENTATION REVIEW phase (5B): corrected plan + diagnosis.
    pub fn review_context(
        &self,
        task: &str,
        test_content: &str,
        test_output: &str,
        impl_files: &[(String, String)],
        budget_tokens: u32,
    ) -> (String, String) {
        let system = self.system_for(REVIEW_PROMPT);

        let mut parts = vec![
            task.to_string(),
            format!("---\n## Test File\n```\n{test_content}\n```"),
            format!("---\n## Test Output (failures)\n```\n{test_output}\n```"),
        ];
        if !impl_files.is_empty() {
            parts.push("---\n## Current Implementation".to_string());
            for (path, content) in impl_files {
                parts.push(format!("\n### {path}\n```\n{content}\n```"));
            }
        }

        self.fit(system, parts.join("\n\n"), budget_tokens)
    }

    /// DK-PING escalation: the stalled-loop consult.
    pub fn dk_ping_context(
        &self,
        task: &str,
        failing_tests: &[String],
        test_output: &str,
        impl_files: &[(String, String)],
        budget_tokens: u32,
    ) -> (String, String) {
        let system = self.system_for(DK_PING_PROMPT);

        let diagnostics = assertion_diagnostics(test_output);
        let output_excerpt: String = test_output.chars().take(DK_OUTPUT_MAX_CHARS).collect();

        let mut parts = vec![task.to_string()];
        if !failing_tests.is_empty() {
            parts.push(format!("---\n## Failing Tests\n{}", failing_tests.join("\n")));
        }
        if !diagnostics.is_empty() {
            parts.push(format!(
                "---\n## Assertion Diagnostics\n```\n{}\n```",
                diagnostics.join("\n")
            ));
        }
        parts.push(format!("---\n## Test Output\n```\n{output_excerpt}\n```"));
        if !impl_files.is_empty() {
            parts.push("---\n## Current Implementation".to_string());
            for (path, content) in impl_files {
                parts.push(format!("\n### {path}\n```\n{content}\n```"));
            }
        }

        self.fit(system, parts.join("\n\n"), budget_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::normalise_plan;
    use serde_json::Value;

    fn assembler() -> ContextAssembler {
        ContextAssembler::new("Write boring, obvious code.".to_string())
    }

    fn sample_plan() -> Vec<PlanEntry> {
        let raw: Vec<Value> = serde_json::from_str(r#"[{"file": "adder.py", "action": "create"}]"#).unwrap();
        normalise_plan(&raw, "")
    }

    #[test]
    fn test_estimate_tokens_three_chars_per_token() {
        assert_eq!(estimate_tokens("abcdef"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_truncate_under_limit_is_identity() {
        assert_eq!(truncate_to_tokens("short", 100), "short");
    }

    #[test]
    fn test_truncate_over_limit_adds_marker() {
        let long = "x".repeat(1000);
        let cut = truncate_to_tokens(&long, 10);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(cut.len() < long.len());
    }

    #[test]
    fn test_fit_never_truncates_system() {
        let philosophy = "P".repeat(3000);
        let asm = ContextAssembler::new(philosophy.clone());
        let big_summary = "s".repeat(60_000);
        let (system, user) = asm.plan_context("task", &big_summary, &[], 2048);
        assert!(system.contains(&philosophy));
        assert!(user.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_fit_leaves_small_prompts_alone() {
        let asm = assembler();
        let (_, user) = asm.plan_context("task", "(empty workspace)", &[], 16_384);
        assert!(!user.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_plan_context_includes_scope_files() {
        let asm = assembler();
        let scope = vec![("util.py".to_string(), "X = 1".to_string())];
        let (_, user) = asm.plan_context("task", "summary", &scope, 16_384);
        assert!(user.contains("## Scope File Contents"));
        assert!(user.contains("### util.py"));
        assert!(user.contains("X = 1"));
    }

    #[test]
    fn test_implement_sections_in_fixed_order() {
        let asm = assembler();
        let output = "FAILED test_adder.py::test_add - AssertionError\nE  assert 4 == 5";
        let (_, user) = asm.implement_context(
            "the task",
            &sample_plan(),
            &[("adder.py".to_string(), "def add(): pass".to_string())],
            "subtraction instead of addition",
            output,
            "# Fix: operator\ndef add(a, b):\n    return a + b",
            "Try a completely different strategy.",
            16_384,
        );
        let plan_at = user.find("## Implementation Plan").unwrap();
        let diag_at = user.find("## Previous Attempt Failed").unwrap();
        let fail_at = user.find("## Test Failures").unwrap();
        let code_at = user.find("## Corrected Functions From Review").unwrap();
        let hint_at = user.find("## IMPORTANT").unwrap();
        let files_at = user.find("## Current File Contents").unwrap();
        assert!(plan_at < diag_at);
        assert!(diag_at < fail_at);
        assert!(fail_at < code_at);
        assert!(code_at < hint_at);
        assert!(hint_at < files_at);
    }

    #[test]
    fn test_implement_omitted_sections_leave_no_trace() {
        let asm = assembler();
        let (_, user) =
            asm.implement_context("task", &sample_plan(), &[], "", "", "", "", 16_384);
        assert!(!user.contains("## Previous Attempt Failed"));
        assert!(!user.contains("## Test Failures"));
        assert!(!user.contains("## Corrected Functions From Review"));
        assert!(!user.contains("## IMPORTANT"));
        assert!(!user.contains("## Current File Contents"));
    }

    #[test]
    fn test_extract_failure_lines_selects_and_caps() {
        let mut output = String::from("collected 40 items\n");
        for i in 0..40 {
            output.push_str(&format!("FAILED test_mod.py::test_{i}\n"));
        }
        output.push_str("====== 40 failed in 0.2s ======\n");
        let lines = extract_failure_lines(&output);
        assert_eq!(lines.len(), 30);
        assert!(lines.iter().all(|l| l.contains("FAILED")));
    }

    #[test]
    fn test_extract_failure_lines_matches_assertion_context() {
        let output = "test_x.py::test_a PASSED\n>       assert add(2, 3) == 5\nE       assert 6 == 5\nTypeError: bad\nsome chatter\n";
        let lines = extract_failure_lines(output);
        assert_eq!(lines.len(), 3);
        assert!(!lines.iter().any(|l| l.contains("chatter")));
    }

    #[test]
    fn test_dk_ping_output_capped_at_6000_chars() {
        let asm = assembler();
        let output = "y".repeat(20_000);
        let (_, user) = asm.dk_ping_context("task", &[], &output, &[], 61_440);
        let run_len = user.chars().filter(|c| *c == 'y').count();
        assert_eq!(run_len, 6000);
    }

    #[test]
    fn test_dk_ping_lists_failing_tests() {
        let asm = assembler();
        let failing = vec!["test_mod.py::test_a".to_string(), "test_mod.py::test_b".to_string()];
        let (_, user) = asm.dk_ping_context("task", &failing, "E assert 1 == 2", &[], 61_440);
        assert!(user.contains("## Failing Tests"));
        assert!(user.contains("test_mod.py::test_a"));
        assert!(user.contains("## Assertion Diagnostics"));
    }

    #[test]
    fn test_audit_context_contains_tests_and_output() {
        let asm = assembler();
        let (system, user) =
            asm.audit_context("task", "def test_a(): pass", "FAILED test_a", 16_384);
        assert!(system.contains("tests_correct"));
        assert!(user.contains("## Test File"));
        assert!(user.contains("## Test Output (failures)"));
    }

    #[test]
    fn test_review_context_contains_implementation() {
        let asm = assembler();
        let files = vec![("adder.py".to_string(), "def add(a, b): return a - b".to_string())];
        let (system, user) = asm.review_context("task", "tests", "output", &files, 16_384);
        assert!(system.contains("diagnosis"));
        assert!(user.contains("## Current Implementation"));
        assert!(user.contains("return a - b"));
    }
}
