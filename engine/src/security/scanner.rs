//! Static malware heuristics over plugin sources
//!
//! The scanner is a text-level pass: it does not parse JavaScript, so every
//! finding carries a confidence below 1.0.

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{SecurityIssue, Severity, ThreatType};
use std::collections::BTreeMap;

struct Rule {
    pattern: Regex,
    threat_type: ThreatType,
    severity: Severity,
    confidence: f32,
    description: &'static str,
    suggestion: &'static str,
}

/// Regex-driven source scanner
pub struct MalwareScanner {
    rules: Vec<Rule>,
    long_line_threshold: usize,
    obfuscation_ratio: f64,
}

impl MalwareScanner {
    /// Build the scanner with the built-in rule set
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if a rule fails to compile.
    pub fn new(long_line_threshold: usize, obfuscation_ratio: f64) -> Result<Self, EngineError> {
        use Severity::*;
        use ThreatType::*;

        let specs: [(&str, ThreatType, Severity, f32, &'static str, &'static str); 12] = [
            (
                r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:child_process|vm)['"]"#,
                RestrictedImport,
                High,
                0.9,
                "imports a process-spawning or sandbox-escaping module",
                "Remove the import; plugins may not spawn processes",
            ),
            (
                r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:fs|net|dgram|http|https|worker_threads|cluster)['"]"#,
                RestrictedImport,
                Medium,
                0.7,
                "imports a restricted host module",
                "Use the host storage and network APIs instead",
            ),
            (
                r"\beval\s*\(",
                DangerousCall,
                High,
                0.8,
                "calls eval()",
                "Replace dynamic evaluation with explicit logic",
            ),
            (
                r"\bnew\s+Function\s*\(",
                DangerousCall,
                High,
                0.8,
                "constructs code with new Function()",
                "Replace dynamic evaluation with explicit logic",
            ),
            (
                r#"\b(?:setTimeout|setInterval)\s*\(\s*['"`]"#,
                DangerousCall,
                Medium,
                0.6,
                "passes a string to a timer, which evaluates it",
                "Pass a function instead of a string",
            ),
            (
                r"\b(?:execSync|spawnSync|execFile)\s*\(|\bchild_process\s*\.\s*(?:exec|spawn)\s*\(",
                DangerousCall,
                Critical,
                0.9,
                "executes shell commands",
                "Plugins may not execute shell commands",
            ),
            (
                r"\brm\s+-rf\s+[/~]",
                DangerousCall,
                Critical,
                0.95,
                "contains a recursive delete of a root or home path",
                "Remove destructive shell commands",
            ),
            (
                r"(?i)\b(?:coinhive|cryptonight|stratum\+tcp|xmrig)\b",
                SuspiciousPattern,
                Critical,
                0.9,
                "references cryptocurrency mining infrastructure",
                "Remove mining code",
            ),
            (
                r"\bdocument\s*\.\s*cookie\b",
                SuspiciousPattern,
                Medium,
                0.6,
                "reads or writes document.cookie",
                "Use the host storage API for persistent data",
            ),
            (
                r"\bprocess\s*\.\s*env\b",
                SuspiciousPattern,
                Low,
                0.4,
                "reads process environment variables",
                "Read configuration from the plugin config block",
            ),
            (
                r"\batob\s*\(",
                SuspiciousPattern,
                Low,
                0.3,
                "decodes base64 at runtime",
                "Ship decoded assets instead of encoded blobs",
            ),
            (
                r"(?:\\x[0-9a-fA-F]{2}){8,}",
                Obfuscation,
                Medium,
                0.6,
                "contains long runs of hex-escaped characters",
                "Ship readable sources",
            ),
        ];

        let rules = specs
            .into_iter()
            .map(|(pattern, threat_type, severity, confidence, description, suggestion)| {
                Regex::new(pattern)
                    .map(|pattern| Rule {
                        pattern,
                        threat_type,
                        severity,
                        confidence,
                        description,
                        suggestion,
                    })
                    .map_err(|e| EngineError::Config(format!("Invalid scan rule: {}", e)))
            })
            .collect::<Result<Vec<Rule>, EngineError>>()?;

        Ok(Self {
            rules,
            long_line_threshold,
            obfuscation_ratio,
        })
    }

    /// Scan every file and return all findings
    pub fn scan(&self, files: &BTreeMap<String, String>) -> Vec<SecurityIssue> {
        let mut issues = Vec::new();

        for (path, source) in files {
            for rule in &self.rules {
                let hits = rule.pattern.find_iter(source).count();
                if hits == 0 {
                    continue;
                }
                tracing::debug!(file = %path, hits, "Scan rule matched: {}", rule.description);
                issues.push(
                    SecurityIssue::new(
                        rule.threat_type,
                        rule.severity,
                        rule.confidence,
                        format!("{} ({} occurrence(s))", rule.description, hits),
                    )
                    .in_file(path.clone())
                    .with_suggestion(rule.suggestion),
                );
            }

            if let Some(issue) = self.check_obfuscation(path, source) {
                issues.push(issue);
            }
        }

        issues
    }

    /// Flag files where a high share of lines is very long (minified or packed code)
    fn check_obfuscation(&self, path: &str, source: &str) -> Option<SecurityIssue> {
        let total = source.lines().count();
        if total == 0 {
            return None;
        }

        let long = source
            .lines()
            .filter(|line| line.chars().count() > self.long_line_threshold)
            .count();
        let ratio = long as f64 / total as f64;

        if long == 0 || ratio <= self.obfuscation_ratio {
            return None;
        }

        Some(
            SecurityIssue::new(
                ThreatType::Obfuscation,
                Severity::Medium,
                ratio as f32,
                format!(
                    "{} of {} lines exceed {} characters; the file may be obfuscated",
                    long, total, self.long_line_threshold
                ),
            )
            .in_file(path)
            .with_suggestion("Publish unminified sources"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_one(source: &str) -> Vec<SecurityIssue> {
        let scanner = MalwareScanner::new(500, 0.1).unwrap();
        let mut files = BTreeMap::new();
        files.insert("index.js".to_string(), source.to_string());
        scanner.scan(&files)
    }

    #[test]
    fn test_clean_source() {
        let issues = scan_one("export function activate(ctx) {\n  return ctx.id;\n}\n");
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn test_eval_is_high() {
        let issues = scan_one("const x = eval(input);");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].threat_type, ThreatType::DangerousCall);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].file.as_deref(), Some("index.js"));
    }

    #[test]
    fn test_restricted_import() {
        let issues = scan_one("const cp = require('child_process');");
        assert!(issues
            .iter()
            .any(|i| i.threat_type == ThreatType::RestrictedImport && i.severity == Severity::High));
    }

    #[test]
    fn test_mining_is_critical() {
        let issues = scan_one("connect('stratum+tcp://pool.example:3333')");
        assert!(issues.iter().any(|i| i.severity == Severity::Critical));
    }

    #[test]
    fn test_low_severity_patterns() {
        let issues = scan_one("const key = process.env.KEY;\nconst s = atob(blob);");
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.severity == Severity::Low));
    }

    #[test]
    fn test_long_lines_flagged_as_obfuscation() {
        let long_line = "a".repeat(600);
        let source = format!("{}\n{}\nshort\n", long_line, long_line);
        let issues = scan_one(&source);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].threat_type, ThreatType::Obfuscation);
    }

    #[test]
    fn test_method_named_exec_not_flagged() {
        assert!(scan_one("const m = /a/.exec(text);").is_empty());
    }
}
