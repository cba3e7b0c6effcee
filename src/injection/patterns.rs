//! Builtin prompt-injection signature table.
//!
//! Transcripts come from spoken audio, so signatures match loose phrasing
//! (`\s+` between words, case-insensitive) rather than exact strings. The
//! builtin set covers English and Polish, mirroring the deployments this
//! gateway fronts; deployment-specific additions come in through
//! `injection.extra_patterns`.

use regex::{Regex, RegexBuilder};

use crate::config::ConfigError;

/// How a matched signature counts toward the rejection threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Counts toward rejection unconditionally.
    Blocking,
    /// Reported and sanitized, counted only when
    /// `injection.count_advisory_patterns` is set.
    Advisory,
}

/// A compiled signature ready to scan transcripts.
#[derive(Debug)]
pub struct Signature {
    /// Stable identifier reported in findings and audit events.
    pub id: String,
    /// Threshold weight.
    pub severity: Severity,
    /// Compiled matcher.
    pub regex: Regex,
}

/// Builtin signature source table: id, severity, pattern.
const BUILTIN: &[(&str, Severity, &str)] = &[
    (
        "instruction-override-en",
        Severity::Blocking,
        r"ignore\s+(?:all\s+)?previous\s+instructions",
    ),
    (
        "instruction-override-pl",
        Severity::Blocking,
        r"zignoruj\s+(?:wszystkie\s+)?wcze[sś]niejsze\s+instrukcje",
    ),
    (
        "command-execution-en",
        Severity::Blocking,
        r"execute\s+(?:the\s+)?command",
    ),
    (
        "command-execution-pl",
        Severity::Blocking,
        r"wykonaj\s+polecenie",
    ),
    (
        "file-write-en",
        Severity::Blocking,
        r"write\s+(?:this\s+|it\s+)?to\s+(?:a\s+|the\s+)?file",
    ),
    ("file-write-pl", Severity::Blocking, r"zapisz\s+w\s+pliku"),
    (
        "credential-probe-en",
        Severity::Blocking,
        r"(?:server|admin|database)\s+password",
    ),
    (
        "credential-probe-pl",
        Severity::Blocking,
        r"has[lł]o\s+do\s+serwera",
    ),
    (
        "privilege-escalation-en",
        Severity::Blocking,
        r"(?:root\s+access|administrator\s+privileges)",
    ),
    (
        "privilege-escalation-pl",
        Severity::Blocking,
        r"uprawnienia\s+administratora",
    ),
    (
        "system-prompt-en",
        Severity::Advisory,
        r"system\s+prompt",
    ),
    (
        "system-prompt-pl",
        Severity::Advisory,
        r"prompt\s+systemowy",
    ),
    (
        "role-play-en",
        Severity::Advisory,
        r"(?:pretend|act\s+as\s+if)\s+you\s+are",
    ),
];

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Compile the builtin table plus deployment extras.
///
/// Extras are `Blocking` and get ids `extra-0`, `extra-1`, ... in config
/// order. A malformed extra fails construction; silently skipping a
/// signature would weaken the policy the operator asked for.
pub fn compile_signatures(extra: &[String]) -> Result<Vec<Signature>, ConfigError> {
    let mut signatures = Vec::with_capacity(BUILTIN.len() + extra.len());

    for (id, severity, pattern) in BUILTIN {
        let regex = compile(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "injection.builtin_patterns",
            message: format!("signature {} failed to compile: {}", id, e),
        })?;
        signatures.push(Signature {
            id: (*id).to_string(),
            severity: *severity,
            regex,
        });
    }

    for (index, pattern) in extra.iter().enumerate() {
        let regex = compile(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "injection.extra_patterns",
            message: format!("pattern {:?} failed to compile: {}", pattern, e),
        })?;
        signatures.push(Signature {
            id: format!("extra-{}", index),
            severity: Severity::Blocking,
            regex,
        });
    }

    Ok(signatures)
}
