//! Post-flight output scrubbing.
//!
//! The [`OutputValidator`] rewrites payload display strings in place:
//! terminal escapes, box-drawing decoration and known hallucination
//! triggers are removed, and personal data (email, IBAN, card and phone
//! numbers) is replaced by `[LABEL]` placeholders. Every redaction counts
//! as one warning; the count is stored under `meta.extra["warnings"]`.
//! Content is never touched.

use regex::Regex;
use switchyard_types::Payload;
use tracing::{debug, warn};

const ANSI: &str = r"\x1b\[[0-9;]*[a-zA-Z]";

const BOX_CHARS: &str = "╔╗╚╝═║─│├┤┬┴┼┌┐└┘╠╣╦╩╬━┃┏┓┗┛┣┫┳┻╋╭╮╯╰\
▀▁▂▃▄▅▆▇█▉▊▋▌▍▎▏░▒▓■□▢▣▤▥▦▧▨▩★☆●○◆◇◈◉◊►◄▲▼◀▶";

const HALLUCINATION_TRIGGERS: &str = r"(?i)(?:QUEST\s+(?:XIII|X[IV]+)|THE\s+WILL|AUTONOMOUS\s+MODE|SELF[\-_]EXECUTE|ACTIVATE\s+PROTOCOL)";

/// PII patterns, most specific first. Group 2 of `PHONE` is the number;
/// groups 1 and 3 keep it from touching other digits.
const PII_PATTERNS: &[(&str, &str)] = &[
    ("EMAIL", r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+"),
    ("IBAN", r"\b[A-Z]{2}\d{2}[A-Z0-9]{4}\d{7,25}\b"),
    ("CREDITCARD", r"\b(?:\d[ -]?){13,19}\b"),
    (
        "PHONE",
        r"(^|\D)((?:\+31|0)[\s.-]?(?:[1-9]\d{1,2}[\s.-]?\d{6,7}|\d[\s.-]?\d{7}))(\D|$)",
    ),
];

struct Rule {
    regex: Regex,
    replacement: String,
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| warn!(pattern, error = %e, "skipping invalid validator pattern"))
        .ok()
}

/// Scrubs display strings.
pub struct OutputValidator {
    /// Removals and replacements applied in order, each counting warnings.
    rules: Vec<Rule>,
    blank_lines: Option<Regex>,
    excess_newlines: Option<Regex>,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputValidator {
    pub fn new() -> Self {
        let mut rules = Vec::new();
        let box_class = format!("[{}]+", regex::escape(BOX_CHARS));
        for (pattern, replacement) in [
            (ANSI.to_string(), String::new()),
            (box_class, String::new()),
            (HALLUCINATION_TRIGGERS.to_string(), "[FILTERED]".to_string()),
        ] {
            if let Some(regex) = compile(&pattern) {
                rules.push(Rule { regex, replacement });
            }
        }
        for (label, pattern) in PII_PATTERNS {
            let replacement = if *label == "PHONE" {
                format!("${{1}}[{label}]${{3}}")
            } else {
                format!("[{label}]")
            };
            if let Some(regex) = compile(pattern) {
                rules.push(Rule { regex, replacement });
            }
        }
        Self {
            rules,
            blank_lines: compile(r"(?m)^[ \t]+$"),
            excess_newlines: compile(r"\n{3,}"),
        }
    }

    /// Scrub `text`, returning the cleaned string and the redaction count.
    pub fn sanitize(&self, text: &str) -> (String, usize) {
        if text.is_empty() {
            return (String::new(), 0);
        }
        let mut out = text.to_string();
        let mut warnings = 0;
        for rule in &self.rules {
            let hits = rule.regex.find_iter(&out).count();
            if hits > 0 {
                warnings += hits;
                out = rule
                    .regex
                    .replace_all(&out, rule.replacement.as_str())
                    .into_owned();
            }
        }
        if let Some(re) = &self.blank_lines {
            out = re.replace_all(&out, "").into_owned();
        }
        if let Some(re) = &self.excess_newlines {
            out = re.replace_all(&out, "\n\n").into_owned();
        }
        (out.trim().to_string(), warnings)
    }

    /// Scrub one payload's display string. Returns the warning count.
    pub fn validate(&self, payload: &mut Payload) -> usize {
        let (clean, warnings) = self.sanitize(payload.display());
        if clean != payload.display() {
            payload.set_display(clean);
        }
        if warnings > 0 {
            debug!(worker = %payload.worker(), warnings, "display redacted");
            payload
                .meta
                .extra
                .insert("warnings".into(), serde_json::json!(warnings));
        }
        warnings
    }
}
