// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output Scanner: turns an agent's raw PTY byte stream into three kinds of
//! events — echo match, activity observed, idle observed — by matching a
//! per-runtime, data-driven pattern set against a normalized view of the
//! stream. The pattern set is loaded from JSON at startup (and reloadable on
//! demand); hardcoded regex lists are the fragility this design explicitly
//! avoids reproducing (§9 Design Notes).

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The raw, reloadable pattern set for one runtime, as loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimePatternSet {
    #[serde(default)]
    pub activity: Vec<String>,
    #[serde(default)]
    pub idle: Vec<String>,
}

/// On-disk shape of the pattern file: one [`RuntimePatternSet`] per runtime
/// name, plus an optional `"default"` entry used for unrecognized runtimes.
pub type PatternFile = HashMap<String, RuntimePatternSet>;

struct Compiled {
    activity: Vec<Regex>,
    idle: Vec<Regex>,
}

/// Strips ANSI CSI/SGR escape sequences from a byte stream. `None` means the
/// pattern failed to compile, in which case callers skip stripping rather
/// than panic.
static ANSI_ESCAPE: OnceLock<Option<Regex>> = OnceLock::new();

fn ansi_escape() -> Option<&'static Regex> {
    ANSI_ESCAPE
        .get_or_init(|| Regex::new(r"\x1b(\[[0-9;?]*[a-zA-Z]|\][^\x07]*\x07|[@-Z\\-_])").ok())
        .as_ref()
}

fn builtin_claude() -> RuntimePatternSet {
    RuntimePatternSet {
        activity: vec![
            r"(?i)\b(thinking|pondering|mulling|noodling|reticulating)\b".to_owned(),
            r"[\u{2800}-\u{28FF}]".to_owned(), // braille spinner glyphs
            r"(?i)\btool_use\b|\bRunning\b".to_owned(),
        ],
        idle: vec![r"(?m)^\s*>\s*$".to_owned(), r"(?i)Human:\s*$".to_owned()],
    }
}

fn builtin_codex() -> RuntimePatternSet {
    RuntimePatternSet {
        activity: vec![r"(?i)\bworking\b|\bexecuting\b".to_owned(), r"[\u{2801}-\u{28FF}]".to_owned()],
        idle: vec![r"(?m)^\s*codex>\s*$".to_owned()],
    }
}

fn builtin_gemini() -> RuntimePatternSet {
    RuntimePatternSet {
        activity: vec![r"(?i)\bgenerating\b|\bthinking\b".to_owned()],
        idle: vec![r"(?m)^\s*>\s*$".to_owned()],
    }
}

fn builtin_default() -> RuntimePatternSet {
    RuntimePatternSet { activity: vec![], idle: vec![r"(?m)^\s*[$#>]\s*$".to_owned()] }
}

/// Parses the injected-message and activity/idle patterns for every agent
/// runtime. Owned by the Broker Core; patterns are data and can be swapped
/// out at runtime via [`OutputScanner::reload`] without touching code.
pub struct OutputScanner {
    runtimes: HashMap<String, Compiled>,
    echo_window_bytes: usize,
}

impl OutputScanner {
    /// Build a scanner from the built-in pattern sets (claude/codex/gemini
    /// plus a generic fallback), used when no `activity_patterns_path` is
    /// configured.
    pub fn with_builtin_defaults(echo_window_bytes: usize) -> Self {
        let mut file = PatternFile::new();
        file.insert("claude".to_owned(), builtin_claude());
        file.insert("codex".to_owned(), builtin_codex());
        file.insert("gemini".to_owned(), builtin_gemini());
        file.insert("default".to_owned(), builtin_default());
        Self { runtimes: compile(&file), echo_window_bytes }
    }

    /// Load a pattern file from disk and compile it, replacing the built-in
    /// default runtime entry with whatever the file provides.
    pub fn load_patterns(path: &Path) -> anyhow::Result<PatternFile> {
        let contents = std::fs::read_to_string(path)?;
        let file: PatternFile = serde_json::from_str(&contents)?;
        Ok(file)
    }

    /// Reload the pattern set from `path` in place. Invalid regexes in the
    /// new file are rejected and the previous pattern set is left untouched.
    pub fn reload(&mut self, path: &Path) -> anyhow::Result<()> {
        let file = Self::load_patterns(path)?;
        let compiled = compile(&file);
        self.runtimes = compiled;
        Ok(())
    }

    pub fn echo_window_bytes(&self) -> usize {
        self.echo_window_bytes
    }

    fn runtime(&self, runtime_kind: &str) -> Option<&Compiled> {
        self.runtimes.get(runtime_kind).or_else(|| self.runtimes.get("default"))
    }

    /// Does `window` (the bytes observed since injection, already capped to
    /// [`echo_window_bytes`](Self::echo_window_bytes)) contain the injected
    /// message after normalization?
    pub fn scan_echo(&self, window: &[u8], injected_body: &str) -> bool {
        if injected_body.is_empty() {
            return false;
        }
        normalize(window).contains(injected_body)
    }

    pub fn scan_activity(&self, runtime_kind: &str, window: &[u8]) -> bool {
        let Some(runtime) = self.runtime(runtime_kind) else { return false };
        let text = normalize(window);
        runtime.activity.iter().any(|re| re.is_match(&text))
    }

    pub fn scan_idle(&self, runtime_kind: &str, window: &[u8]) -> bool {
        let Some(runtime) = self.runtime(runtime_kind) else { return false };
        let text = normalize(window);
        runtime.idle.iter().any(|re| re.is_match(&text))
    }
}

fn compile(file: &PatternFile) -> HashMap<String, Compiled> {
    let mut out = HashMap::with_capacity(file.len());
    for (name, set) in file {
        let activity = set.activity.iter().filter_map(|p| Regex::new(p).ok()).collect();
        let idle = set.idle.iter().filter_map(|p| Regex::new(p).ok()).collect();
        out.insert(name.clone(), Compiled { activity, idle });
    }
    out
}

/// Normalize a byte window for pattern matching: strip ANSI/SGR escapes,
/// collapse runs of whitespace to a single space, and trim surrounding quote
/// characters a runtime might wrap echoed input in.
pub fn normalize(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let stripped = match ansi_escape() {
        Some(re) => re.replace_all(&text, ""),
        None => std::borrow::Cow::Borrowed(text.as_ref()),
    };
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches(|c: char| c == '"' || c == '\'' || c == '`').to_owned()
}

#[cfg(test)]
#[path = "scanner_tests.rs"]
mod tests;
