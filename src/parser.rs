/// Recovery of structured output from loosely-formatted model text.
///
/// Models return near-JSON with wildly varying schemas. The tolerance all
/// lives here: fence stripping, brace-span rescue, key-synonym tables, and a
/// last-resort filename scan. Nothing past this boundary sees a raw model
/// document.
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

use regex::Regex;

#[derive(Debug, Error)]
#[error("could not parse JSON from model output:\n{preview}")]
pub struct ParseError {
    /// First 500 chars of the offending output, for the log.
    pub preview: String,
}

// ── Plan entry ────────────────────────────────────────────────────────────────

/// One per target file. `extra` carries the raw fields the normaliser did
/// not claim, flattened back when the plan is re-serialized into a prompt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanEntry {
    pub file: String,
    pub action: String,
    pub functions: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

// ── JSON recovery ─────────────────────────────────────────────────────────────

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```(?:json)?[ \t]*\n?").unwrap());
static FENCE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n?```\s*$").unwrap());

/// Extract a JSON object from model output. Handles markdown fences, then
/// falls back to the first `{…}` span in the raw text.
pub fn parse_model_json(text: &str) -> Result<Value, ParseError> {
    let cleaned = FENCE_OPEN.replace_all(text.trim(), "");
    let cleaned = FENCE_CLOSE.replace(cleaned.trim(), "");

    if let Ok(v) = serde_json::from_str::<Value>(cleaned.trim()) {
        if v.is_object() {
            return Ok(v);
        }
    }

    // Brace-span rescue: first '{' through last '}' of the raw text
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
                if v.is_object() {
                    return Ok(v);
                }
            }
        }
    }

    Err(ParseError {
        preview: text.chars().take(500).collect(),
    })
}

// ── Block grammars ────────────────────────────────────────────────────────────

static FILE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"===FILE:\s*(.+?)===\s*\n([\s\S]*?)===END FILE===").unwrap());
static CMD_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"===CMD===\s*\n([\s\S]*?)===END CMD===").unwrap());

/// Extract every `===FILE: path=== … ===END FILE===` region, in source order.
pub fn parse_file_blocks(text: &str) -> Vec<FileBlock> {
    FILE_BLOCK
        .captures_iter(text)
        .map(|c| FileBlock {
            path: c[1].trim().to_string(),
            content: c[2].to_string(),
        })
        .collect()
}

/// Extract every `===CMD=== … ===END CMD===` body, whitespace-trimmed.
pub fn parse_command_blocks(text: &str) -> Vec<String> {
    CMD_BLOCK
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect()
}

// ── Plan normalisation ────────────────────────────────────────────────────────

const FILE_KEYS: [&str; 10] = [
    "file", "filename", "filepath", "path", "file_path", "target", "source", "module",
    "target_file", "source_file",
];
const ACTION_KEYS: [&str; 4] = ["action", "operation", "type", "mode"];

static PY_FILE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\w/\\.\-]+\.py\b").unwrap());

/// Normalise plan entries so keys are consistent regardless of whatever
/// schema the model invented.
///
/// `fallback_file`: when set, entries with no detectable file path inherit
/// it. Used when review plans describe function-level fixes without naming
/// the target file (single-file tasks).
pub fn normalise_plan(raw: &[Value], fallback_file: &str) -> Vec<PlanEntry> {
    let mut normalised = Vec::new();

    for entry in raw {
        let mut map = match entry {
            Value::Object(m) => m.clone(),
            // A bare string that names a file gets wrapped into an entry
            Value::String(s) => match PY_FILE.find(s) {
                Some(m) => {
                    let mut obj = Map::new();
                    obj.insert("file".to_string(), Value::String(m.as_str().to_string()));
                    obj
                }
                None => continue,
            },
            _ => continue,
        };

        // Canonicalise the file key -- probe known key names first
        let mut file = match map.remove("file") {
            Some(Value::String(s)) => Some(s),
            // a non-string file value is useless -- fall through to the probes
            _ => None,
        };
        if file.is_none() {
            for key in FILE_KEYS {
                let looks_like_path = map
                    .get(key)
                    .and_then(Value::as_str)
                    .map(|s| s.contains('.'))
                    .unwrap_or(false);
                if looks_like_path {
                    if let Some(Value::String(s)) = map.remove(key) {
                        file = Some(s);
                        break;
                    }
                }
            }
        }

        // Last resort: scan ALL string values for a .py path
        if file.is_none() {
            file = map
                .values()
                .filter_map(Value::as_str)
                .find_map(|s| PY_FILE.find(s))
                .map(|m| m.as_str().to_string());
        }

        // Final fallback: inherit the file from the existing plan
        if file.is_none() && !fallback_file.is_empty() {
            file = Some(fallback_file.to_string());
        }

        let Some(mut file) = file else { continue };

        // Strip workspace/ prefix if the model included it
        for prefix in ["workspace/", "workspace\\", "./", ".\\"] {
            if let Some(rest) = file.strip_prefix(prefix) {
                file = rest.to_string();
            }
        }
        if file.is_empty() {
            continue;
        }

        // Canonicalise the action key
        let mut action = None;
        for key in ACTION_KEYS {
            if map.contains_key(key) {
                if let Some(Value::String(s)) = map.remove(key) {
                    action = Some(s);
                }
                break;
            }
        }
        let action = action.unwrap_or_else(|| "modify".to_string());

        let functions = match map.remove("functions") {
            Some(Value::Array(v)) => v,
            _ => Vec::new(),
        };

        normalised.push(PlanEntry {
            file,
            action,
            functions,
            extra: map,
        });
    }

    normalised
}

// ── Review code extraction ────────────────────────────────────────────────────

/// Collect corrected code snippets from raw review plan entries. Review
/// models often attach a `code` key with the exact corrected function --
/// gather these so the implementer can use them verbatim. Runs on the
/// entries as the model wrote them, before normalisation invents defaults.
/// Returns a formatted string of all corrections, or empty.
pub fn extract_review_code(entries: &[Value]) -> String {
    let mut corrections = Vec::new();

    for entry in entries {
        let Some(entry) = entry.as_object() else { continue };
        let code = entry
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if code.len() <= 10 {
            continue;
        }
        let desc = ["description", "rationale", "reason", "action"]
            .iter()
            .find_map(|k| entry.get(*k).and_then(Value::as_str))
            .unwrap_or("");
        let header = if desc.is_empty() {
            "# Correction from review".to_string()
        } else {
            format!("# Fix: {desc}")
        };
        corrections.push(format!("{header}\n{code}"));
    }

    corrections.join("\n\n")
}

// ── Test counting ─────────────────────────────────────────────────────────────

static TEST_DEF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^def test_").unwrap());

/// Count `def test_…` functions anchored at start-of-line. The regression
/// guard for review-proposed test replacements.
pub fn count_test_functions(content: &str) -> usize {
    TEST_DEF.find_iter(content).count()
}
