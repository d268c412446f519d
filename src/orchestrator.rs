/// The convergence control loop.
///
/// Runs SUMMARISE -> PLAN once, then iterates IMPLEMENT -> TEST -> AUDIT ->
/// REVIEW until the generated test suite passes. Two independent stall
/// counters watch the test results; at the stress threshold the review
/// calls escalate to the consultant, and at the ping threshold the
/// consultant is asked to amend the task's Domain Knowledge and planning
/// starts over. The loop has no iteration cap -- only the stall escalation
/// and the task size cap bound it.
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::client::ModelClient;
use crate::config::{ProfileName, Role, RunConfig};
use crate::context::{ContextAssembler, estimate_tokens};
use crate::logger::Logger;
use crate::parser::{self, PlanEntry};
use crate::sandbox::Executor;
use crate::summary::summarise_codebase;
use crate::task::{TASK_GROWTH_ALLOWANCE, amend_domain_knowledge, load_scope_files, read_file_safe};
use crate::testrun::{TestOutcome, run_tests};

/// At this effective stuck score the implement prompt gets a stuck hint and
/// audit/review escalate to the consultant.
const STUCK_THRESHOLD: u32 = 3;
/// At this effective stuck score the consultant is asked to amend Domain
/// Knowledge and planning restarts.
const DK_PING_THRESHOLD: u32 = 5;

/// How a run ends when it does not fail outright.
#[derive(Debug)]
pub enum RunEnd {
    /// The test suite passed.
    Success,
    /// The escape mechanism stopped the loop without success.
    Halted(String),
}

// ── Stall detection ───────────────────────────────────────────────────────────

/// Two independent repetition counters over the test results. The pattern
/// hash catches exact-output loops; the failing-name set survives cosmetic
/// pass/fail order shuffles. The effective score is the max of the two.
#[derive(Debug, Default)]
struct StallSignals {
    last_pattern_hash: Option<String>,
    stuck_count: u32,
    last_failing_set: Option<BTreeSet<String>>,
    failing_set_count: u32,
}

impl StallSignals {
    fn update(&mut self, test_output: &str) {
        let hash = sha256_hex(&pass_fail_pattern(test_output));
        if self.last_pattern_hash.as_deref() == Some(hash.as_str()) {
            self.stuck_count += 1;
        } else {
            self.stuck_count = 1;
            self.last_pattern_hash = Some(hash);
        }

        let failing = failing_test_names(test_output);
        if self.last_failing_set.as_ref() == Some(&failing) {
            self.failing_set_count += 1;
        } else {
            self.failing_set_count = 1;
            self.last_failing_set = Some(failing);
        }
    }

    fn effective(&self) -> u32 {
        self.stuck_count.max(self.failing_set_count)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Ordered P/F sequence over the per-test result lines of a pytest run.
fn pass_fail_pattern(output: &str) -> String {
    let mut pattern = String::new();
    for line in output.lines() {
        if !line.contains("::") {
            continue;
        }
        if line.contains("PASSED") {
            pattern.push('P');
        } else if line.contains("FAILED") {
            pattern.push('F');
        }
    }
    pattern
}

/// Test identifiers from lines that report a failure.
fn failing_test_names(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter(|l| l.contains("FAILED") && l.contains("::"))
        .filter_map(|l| l.split_whitespace().find(|tok| tok.contains("::")))
        .map(str::to_string)
        .collect()
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A replacement test suite is accepted only if it keeps at least as many
/// test functions as the suite it replaces. The primary defence against a
/// review model passing by shrinking the test surface.
fn accept_test_replacement(proposed: &str, original_count: usize) -> bool {
    !proposed.is_empty() && parser::count_test_functions(proposed) >= original_count
}

fn build_stuck_hint(score: u32, impl_stable_count: u32) -> String {
    if score < STUCK_THRESHOLD {
        return String::new();
    }
    let mut hint = format!(
        "The last {score} iterations produced the same failing results. \
         The previous approach is fundamentally wrong. Try a COMPLETELY \
         different implementation strategy. Re-read the task requirements \
         carefully, especially the Domain Knowledge section."
    );
    if impl_stable_count >= 2 {
        hint.push_str(&format!(
            " You have also produced byte-identical code {impl_stable_count} \
             times in a row. Repeating it will fail again."
        ));
    }
    hint
}

// ── Plan epoch ────────────────────────────────────────────────────────────────

/// Everything Phase 2 establishes. Replaced wholesale when a DK amendment
/// triggers a re-plan.
struct PlanEpoch {
    plan: Vec<PlanEntry>,
    test_filename: String,
    test_content: String,
    original_test_count: usize,
}

// ── File helpers ──────────────────────────────────────────────────────────────

fn write_workspace_file(workspace: &Path, rel: &str, content: &str) -> Result<()> {
    let path = workspace.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for {}", path.display()))?;
    }
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Current on-disk contents of every file the plan targets. Deduplicated,
/// missing files omitted.
fn load_current_files(workspace: &Path, plan: &[PlanEntry]) -> Vec<(String, String)> {
    let mut files: Vec<(String, String)> = Vec::new();
    for entry in plan {
        if files.iter().any(|(p, _)| p == &entry.file) {
            continue;
        }
        let path = workspace.join(&entry.file);
        if path.is_file() {
            files.push((entry.file.clone(), read_file_safe(&path)));
        }
    }
    files
}

// ── Phases 1 + 2 ──────────────────────────────────────────────────────────────

fn phase_summarise(
    config: &RunConfig,
    task: &str,
    logger: &Logger,
) -> (String, Vec<(String, String)>) {
    logger.log("\n--- PHASE 1: SUMMARISE ---");
    let summary = summarise_codebase(&config.workspace);
    logger.log(&format!("Codebase summary: {} tokens", estimate_tokens(&summary)));
    let scope_files = load_scope_files(task, &config.workspace);
    if !scope_files.is_empty() {
        logger.log(&format!("Loaded {} scope files", scope_files.len()));
    }
    (summary, scope_files)
}

async fn phase_plan(
    config: &RunConfig,
    client: &ModelClient,
    assembler: &ContextAssembler,
    task: &str,
    codebase_summary: &str,
    scope_files: &[(String, String)],
    logger: &Logger,
) -> Result<PlanEpoch> {
    logger.log("\n--- PHASE 2: PLAN ---");
    let budget = config.context_budget_for(Role::Consultant);
    let (system, user) = assembler.plan_context(task, codebase_summary, scope_files, budget);
    let output = client
        .call(
            config.model_for(Role::Consultant),
            config.profiles.get(ProfileName::Consultant),
            Role::Consultant,
            &system,
            &user,
            logger,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Plan phase model call failed: {e}"))?;

    let doc = parser::parse_model_json(&output)
        .map_err(|e| anyhow::anyhow!("Plan phase produced unparseable output: {e}"))?;

    let (Some(tests), Some(raw_plan)) = (doc.get("tests"), doc.get("plan").and_then(Value::as_array))
    else {
        let keys: Vec<&String> = doc.as_object().map(|o| o.keys().collect()).unwrap_or_default();
        bail!("Plan JSON missing required keys. Got: {keys:?}");
    };

    let test_filename = tests
        .get("filename")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("test_module.py")
        .to_string();
    let test_content = tests
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let plan = parser::normalise_plan(raw_plan, "");

    if test_content.is_empty() {
        bail!("Plan phase produced empty test content.");
    }
    if plan.is_empty() {
        bail!("Plan phase produced no valid plan entries.");
    }

    logger.log(&format!("Test file: {test_filename}"));
    logger.log(&format!("Plan entries: {}", plan.len()));

    write_workspace_file(&config.workspace, &test_filename, &test_content)?;
    let original_test_count = parser::count_test_functions(&test_content);
    logger.log(&format!(
        "Wrote {test_filename} to workspace ({original_test_count} test functions)"
    ));

    Ok(PlanEpoch {
        plan,
        test_filename,
        test_content,
        original_test_count,
    })
}

// ── DK-ping escalation ────────────────────────────────────────────────────────

enum DkPing {
    /// The task was amended and persisted; carries the new task text.
    Amended(String),
    /// The escape hatch closed -- stop the run without success.
    Halt(String),
}

#[allow(clippy::too_many_arguments)]
async fn dk_ping(
    config: &RunConfig,
    client: &ModelClient,
    assembler: &ContextAssembler,
    task: &str,
    signals: &StallSignals,
    outcome: &TestOutcome,
    epoch: &PlanEpoch,
    iteration: u32,
    task_size_cap: usize,
    logger: &Logger,
) -> Result<DkPing> {
    logger.log("\n--- DK PING: CONSULTING ---");

    let failing: Vec<String> = signals
        .last_failing_set
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let impl_files = load_current_files(&config.workspace, &epoch.plan);
    let budget = config.context_budget_for(Role::Consultant);
    let (system, user) =
        assembler.dk_ping_context(task, &failing, &outcome.output, &impl_files, budget);

    let output = client
        .call(
            config.model_for(Role::Consultant),
            config.profiles.get(ProfileName::Consultant),
            Role::Consultant,
            &system,
            &user,
            logger,
        )
        .await
        .map_err(|e| anyhow::anyhow!("DK consult model call failed: {e}"))?;

    let Ok(doc) = parser::parse_model_json(&output) else {
        return Ok(DkPing::Halt("DK consultant output unparseable".to_string()));
    };

    if let Some(diag) = doc.get("diagnosis").and_then(Value::as_str) {
        logger.log(&format!("DK diagnosis: {diag}"));
    }

    let confidence = doc
        .get("confidence")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    if confidence != "high" && confidence != "medium" {
        return Ok(DkPing::Halt(format!(
            "DK consultant confidence too low ({})",
            if confidence.is_empty() { "missing" } else { confidence.as_str() }
        )));
    }

    let addition = doc
        .get("dk_addition")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if addition.is_empty() {
        return Ok(DkPing::Halt("DK consultant proposed no addition".to_string()));
    }

    let amended = amend_domain_knowledge(task, &addition, iteration);
    if amended.len() > task_size_cap {
        return Ok(DkPing::Halt(format!(
            "DK amendment would exceed the task size cap ({} > {task_size_cap} bytes)",
            amended.len()
        )));
    }

    fs::write(&config.task_path, &amended)
        .with_context(|| format!("Failed to persist amended task to {}", config.task_path.display()))?;
    logger.log(&format!("Domain Knowledge amended at iteration {iteration} ({confidence} confidence)"));

    Ok(DkPing::Amended(amended))
}

// ── The run ───────────────────────────────────────────────────────────────────

pub async fn run(config: &RunConfig, logger: &Logger) -> Result<RunEnd> {
    fs::create_dir_all(&config.workspace)
        .with_context(|| format!("Failed to create workspace at {}", config.workspace.display()))?;

    logger.log(&"=".repeat(60));
    logger.log("REDGREEN -- Starting");
    logger.log(&format!("Workspace:   {}", config.workspace.display()));
    logger.log(&format!("Planner:     {}", config.planner_model));
    logger.log(&format!("Implementer: {}", config.implementer_model));
    logger.log(&format!("Consultant:  {}", config.consultant_model));
    logger.log(&"=".repeat(60));

    let philosophy = read_file_safe(&config.philosophy_path);
    if philosophy.is_empty() {
        bail!(
            "Missing {} -- the orchestrator needs a steering directive.",
            config.philosophy_path.display()
        );
    }
    let mut task = read_file_safe(&config.task_path);
    if task.is_empty() {
        bail!("Missing {} -- no task to execute.", config.task_path.display());
    }

    let original_task_size = task.len();
    let task_size_cap = original_task_size + TASK_GROWTH_ALLOWANCE;

    logger.log(&format!("Philosophy: {} tokens", estimate_tokens(&philosophy)));
    logger.log(&format!("Task: {} tokens", estimate_tokens(&task)));

    let client = ModelClient::new(config.endpoint.clone());
    let executor = Executor::new(config);
    let assembler = ContextAssembler::new(philosophy);

    let (mut codebase_summary, mut scope_files) = phase_summarise(config, &task, logger);
    let mut epoch = phase_plan(
        config,
        &client,
        &assembler,
        &task,
        &codebase_summary,
        &scope_files,
        logger,
    )
    .await?;

    let mut signals = StallSignals::default();
    let mut last_impl_hash: Option<String> = None;
    let mut impl_stable_count: u32 = 0;
    let mut last_diagnosis = String::new();
    let mut last_review_code = String::new();
    let mut last_test_output = String::new();
    let mut iteration: u32 = 0;

    loop {
        iteration += 1;
        logger.log(&format!("\n{}", "=".repeat(40)));
        logger.log(&format!("ITERATION {iteration}"));
        logger.log(&"=".repeat(40));

        // ── PHASE 3: IMPLEMENT ────────────────────────────────────────────────
        logger.log("\n--- PHASE 3: IMPLEMENT ---");

        let current_files = load_current_files(&config.workspace, &epoch.plan);
        let stuck_hint = build_stuck_hint(signals.effective(), impl_stable_count);
        let (system, user) = assembler.implement_context(
            &task,
            &epoch.plan,
            &current_files,
            &last_diagnosis,
            &last_test_output,
            &last_review_code,
            &stuck_hint,
            config.context_budget_for(Role::Implementer),
        );
        let impl_output = client
            .call(
                config.model_for(Role::Implementer),
                config.profiles.get(ProfileName::Implementer),
                Role::Implementer,
                &system,
                &user,
                logger,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Implement phase model call failed: {e}"))?;

        let file_blocks = parser::parse_file_blocks(&impl_output);
        if file_blocks.is_empty() {
            logger.log("WARNING: No file blocks in implementation output");
            let preview: String = impl_output.chars().take(500).collect();
            logger.log(&format!("Raw output preview: {preview}"));
        }
        for block in &file_blocks {
            write_workspace_file(&config.workspace, &block.path, &block.content)?;
            logger.log(&format!("  Wrote: {}", block.path));
        }

        for cmd in parser::parse_command_blocks(&impl_output) {
            let result = executor.execute(&cmd, logger).await;
            if result.returncode != 0 {
                let err: String = result.stderr.chars().take(200).collect();
                logger.log(&format!("  CMD FAILED (rc={}): {err}", result.returncode));
            } else {
                let head: String = cmd.chars().take(80).collect();
                logger.log(&format!("  CMD OK: {head}"));
            }
        }

        // Byte-identical implementer output across iterations is its own
        // stall signal -- fold it into the stuck hint.
        let concatenated: String = file_blocks
            .iter()
            .map(|b| format!("{}\n{}", b.path, b.content))
            .collect();
        let impl_hash = sha256_hex(&concatenated);
        if last_impl_hash.as_deref() == Some(impl_hash.as_str()) {
            impl_stable_count += 1;
            logger.log(&format!("Implementer output unchanged ({impl_stable_count} times)"));
        } else {
            impl_stable_count = 1;
            last_impl_hash = Some(impl_hash);
        }

        // ── PHASE 4: TEST ─────────────────────────────────────────────────────
        logger.log("\n--- PHASE 4: TEST ---");
        let outcome = run_tests(&executor, &epoch.test_filename, logger).await;
        logger.log(&format!("Tests passed: {}", outcome.passed));

        if outcome.passed {
            logger.log(&format!("\n{}", "=".repeat(60)));
            logger.log("ALL TESTS PASS -- TASK COMPLETE");
            logger.log(&"=".repeat(60));
            logger.bell();
            return Ok(RunEnd::Success);
        }

        let excerpt: String = outcome.output.chars().take(4000).collect();
        logger.log(&format!("Test output:\n{excerpt}"));

        signals.update(&outcome.output);
        last_test_output = outcome.output.clone();
        let score = signals.effective();
        if score >= STUCK_THRESHOLD {
            logger.log(&format!(
                "STUCK LOOP DETECTED: same failing results {score} times in a row"
            ));
        }

        // ── DK-PING ESCALATION ────────────────────────────────────────────────
        if score >= DK_PING_THRESHOLD {
            match dk_ping(
                config,
                &client,
                &assembler,
                &task,
                &signals,
                &outcome,
                &epoch,
                iteration,
                task_size_cap,
                logger,
            )
            .await?
            {
                DkPing::Amended(new_task) => {
                    task = new_task;
                    signals.reset();
                    last_impl_hash = None;
                    impl_stable_count = 0;
                    last_diagnosis.clear();
                    last_review_code.clear();
                    last_test_output.clear();

                    (codebase_summary, scope_files) = phase_summarise(config, &task, logger);
                    epoch = phase_plan(
                        config,
                        &client,
                        &assembler,
                        &task,
                        &codebase_summary,
                        &scope_files,
                        logger,
                    )
                    .await?;
                    // review is pre-empted in the iteration the ping fires
                    continue;
                }
                DkPing::Halt(reason) => {
                    logger.log(&format!("HALT: {reason}"));
                    logger.bells(3);
                    return Ok(RunEnd::Halted(reason));
                }
            }
        }

        // Audit/review escalate to the consultant under stress. The
        // conservative profile keeps the escalated calls deterministic.
        let (review_role, review_profile) = if score >= STUCK_THRESHOLD {
            (Role::Consultant, ProfileName::Conservative)
        } else {
            (Role::Planner, ProfileName::Planner)
        };
        let review_budget = config.context_budget_for(review_role);
        logger.log(&format!(
            "Review duty: {} role, {} profile",
            review_role.name(),
            review_profile.as_str()
        ));

        // ── PHASE 5A: TEST AUDIT ──────────────────────────────────────────────
        logger.log("\n--- PHASE 5A: TEST AUDIT ---");

        // the audit sees the suite as it exists on disk
        epoch.test_content = read_file_safe(&config.workspace.join(&epoch.test_filename));

        let (system, user) =
            assembler.audit_context(&task, &epoch.test_content, &outcome.output, review_budget);
        let audit_output = client
            .call(
                config.model_for(review_role),
                config.profiles.get(review_profile),
                review_role,
                &system,
                &user,
                logger,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Audit phase model call failed: {e}"))?;

        match parser::parse_model_json(&audit_output) {
            Ok(audit) => {
                let tests_correct = audit
                    .get("tests_correct")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if let Some(issues) = audit.get("issues").and_then(Value::as_str) {
                    if !issues.is_empty() {
                        logger.log(&format!("Audit issues: {issues}"));
                    }
                }
                if !tests_correct {
                    if let Some(replacement) = audit.get("tests") {
                        let proposed = replacement
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if accept_test_replacement(proposed, epoch.original_test_count) {
                            if let Some(name) = replacement
                                .get("filename")
                                .and_then(Value::as_str)
                                .filter(|s| !s.is_empty())
                            {
                                epoch.test_filename = name.to_string();
                            }
                            epoch.test_content = proposed.to_string();
                            write_workspace_file(&config.workspace, &epoch.test_filename, proposed)?;
                            epoch.original_test_count = parser::count_test_functions(proposed);
                            logger.log(&format!(
                                "Updated tests: {} ({} test functions)",
                                epoch.test_filename, epoch.original_test_count
                            ));
                            // re-implement against the corrected suite; 5B skipped
                            continue;
                        }
                        logger.log(&format!(
                            "REJECTED test update: audit has {} tests, original has {}. \
                             Keeping original to prevent regression.",
                            parser::count_test_functions(proposed),
                            epoch.original_test_count
                        ));
                    }
                }
            }
            Err(e) => {
                logger.log(&format!("WARNING: Audit output unparseable: {e}"));
            }
        }

        // ── PHASE 5B: IMPLEMENTATION REVIEW ───────────────────────────────────
        logger.log("\n--- PHASE 5B: REVIEW ---");

        let impl_files: Vec<(String, String)> = if file_blocks.is_empty() {
            load_current_files(&config.workspace, &epoch.plan)
        } else {
            file_blocks
                .iter()
                .filter(|b| config.workspace.join(&b.path).is_file())
                .map(|b| (b.path.clone(), read_file_safe(&config.workspace.join(&b.path))))
                .collect()
        };

        let (system, user) = assembler.review_context(
            &task,
            &epoch.test_content,
            &outcome.output,
            &impl_files,
            review_budget,
        );
        let review_output = client
            .call(
                config.model_for(review_role),
                config.profiles.get(review_profile),
                review_role,
                &system,
                &user,
                logger,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Review phase model call failed: {e}"))?;

        match parser::parse_model_json(&review_output) {
            Ok(review) => {
                if let Some(diag) = review.get("diagnosis").and_then(Value::as_str) {
                    last_diagnosis = diag.to_string();
                    logger.log(&format!("Diagnosis: {last_diagnosis}"));
                }
                if let Some(raw_plan) = review.get("plan").and_then(Value::as_array) {
                    // corrections come off the raw entries, before
                    // normalisation invents file/action defaults
                    last_review_code = parser::extract_review_code(raw_plan);
                    if !last_review_code.is_empty() {
                        let count = last_review_code.matches("# Fix:").count()
                            + last_review_code.matches("# Correction").count();
                        logger.log(&format!("Extracted {count} code corrections from review"));
                    }

                    let fallback = epoch.plan.first().map(|e| e.file.clone()).unwrap_or_default();
                    let new_plan = parser::normalise_plan(raw_plan, &fallback);
                    if new_plan.is_empty() {
                        logger.log(
                            "WARNING: Review plan had no valid entries after normalisation, \
                             keeping previous plan",
                        );
                    } else {
                        epoch.plan = new_plan;
                        logger.log(&format!("Updated plan: {} entries", epoch.plan.len()));
                    }
                }
            }
            Err(e) => {
                logger.log(&format!("WARNING: Review output unparseable: {e}"));
                logger.log("Retrying implementation with same plan...");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT_A: &str = "test_mod.py::test_add FAILED\ntest_mod.py::test_sub PASSED\nE   assert 6 == 5\n";
    const OUTPUT_A_NOISY: &str = "test_mod.py::test_add FAILED\ntest_mod.py::test_sub PASSED\nE   assert 6 == 5\nran in 0.13s\n";
    const OUTPUT_B: &str = "test_mod.py::test_add PASSED\ntest_mod.py::test_sub FAILED\n";

    #[test]
    fn test_pass_fail_pattern_ordered() {
        assert_eq!(pass_fail_pattern(OUTPUT_A), "FP");
        assert_eq!(pass_fail_pattern(OUTPUT_B), "PF");
        assert_eq!(pass_fail_pattern("no test lines here"), "");
    }

    #[test]
    fn test_failing_test_names_extracted() {
        let names = failing_test_names(OUTPUT_A);
        assert_eq!(names.len(), 1);
        assert!(names.contains("test_mod.py::test_add"));

        // short-summary style line
        let names = failing_test_names("FAILED test_mod.py::test_div - ZeroDivisionError");
        assert!(names.contains("test_mod.py::test_div"));
    }

    #[test]
    fn test_stall_counters_increment_on_repetition() {
        let mut signals = StallSignals::default();
        signals.update(OUTPUT_A);
        assert_eq!(signals.stuck_count, 1);
        assert_eq!(signals.failing_set_count, 1);
        assert_eq!(signals.effective(), 1);

        signals.update(OUTPUT_A);
        assert_eq!(signals.stuck_count, 2);
        assert_eq!(signals.failing_set_count, 2);
        assert_eq!(signals.effective(), 2);
    }

    #[test]
    fn test_pattern_hash_ignores_cosmetic_output_changes() {
        let mut signals = StallSignals::default();
        signals.update(OUTPUT_A);
        // timing chatter changed, but the P/F pattern did not
        signals.update(OUTPUT_A_NOISY);
        assert_eq!(signals.stuck_count, 2);
    }

    #[test]
    fn test_counters_are_independent() {
        let mut signals = StallSignals::default();
        signals.update(OUTPUT_A);
        signals.update(OUTPUT_B); // different pattern AND different failing set
        assert_eq!(signals.stuck_count, 1);
        assert_eq!(signals.failing_set_count, 1);

        // same failing set as B, but an extra passing line shifts the pattern
        let b_variant = "test_mod.py::test_extra PASSED\ntest_mod.py::test_add PASSED\ntest_mod.py::test_sub FAILED\n";
        signals.update(b_variant);
        assert_eq!(signals.stuck_count, 1, "pattern changed, counter must reset");
        assert_eq!(signals.failing_set_count, 2, "failing set repeated, counter must grow");
        assert_eq!(signals.effective(), 2);
    }

    #[test]
    fn test_signals_reset_clears_everything() {
        let mut signals = StallSignals::default();
        signals.update(OUTPUT_A);
        signals.update(OUTPUT_A);
        signals.reset();
        assert_eq!(signals.effective(), 0);
        signals.update(OUTPUT_A);
        assert_eq!(signals.stuck_count, 1);
    }

    #[test]
    fn test_accept_test_replacement_guards_regression() {
        let five = "def test_a(): pass\ndef test_b(): pass\ndef test_c(): pass\ndef test_d(): pass\ndef test_e(): pass\n";
        let three = "def test_a(): pass\ndef test_b(): pass\ndef test_c(): pass\n";
        assert!(accept_test_replacement(five, 5));
        assert!(!accept_test_replacement(three, 5));
        assert!(accept_test_replacement(five, 3));
        assert!(!accept_test_replacement("", 0));
    }

    #[test]
    fn test_stuck_hint_only_at_threshold() {
        assert!(build_stuck_hint(1, 0).is_empty());
        assert!(build_stuck_hint(2, 0).is_empty());
        let hint = build_stuck_hint(3, 0);
        assert!(hint.contains("COMPLETELY different"));
        assert!(!hint.contains("byte-identical"));
        let hint = build_stuck_hint(4, 3);
        assert!(hint.contains("byte-identical"));
    }

    #[test]
    fn test_task_size_cap_never_exceeded_across_amendments() {
        // mirrors the controller's acceptance loop: an amendment that would
        // cross the cap is rejected, so the cap holds for any sequence
        let original = "## Domain Knowledge\nBase fact.\n".to_string();
        let cap = original.len() + TASK_GROWTH_ALLOWANCE;
        let mut task = original;
        let mut accepted = 0u32;
        for iteration in 1..=20 {
            let amended = amend_domain_knowledge(&task, &"f".repeat(400), iteration);
            if amended.len() > cap {
                break;
            }
            task = amended;
            accepted += 1;
        }
        assert!(task.len() <= cap);
        assert!(accepted >= 1, "at least one amendment fits under the cap");
        assert!(accepted < 20, "the cap must eventually reject");
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(sha256_hex("abc"), sha256_hex("abd"));
        assert_eq!(sha256_hex("abc").len(), 64);
    }

    #[test]
    fn test_write_workspace_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        write_workspace_file(dir.path(), "pkg/sub/mod.py", "x = 1\n").unwrap();
        let written = std::fs::read_to_string(dir.path().join("pkg/sub/mod.py")).unwrap();
        assert_eq!(written, "x = 1\n");
    }

    #[test]
    fn test_load_current_files_skips_missing_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "A").unwrap();
        let raw: Vec<Value> = serde_json::from_str(
            r#"[{"file": "a.py"}, {"file": "a.py"}, {"file": "missing.py"}]"#,
        )
        .unwrap();
        let plan = parser::normalise_plan(&raw, "");
        let files = load_current_files(dir.path(), &plan);
        assert_eq!(files, vec![("a.py".to_string(), "A".to_string())]);
    }
}
