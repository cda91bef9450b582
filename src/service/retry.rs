//! Validation categories and the one-retry dispatcher shared by the text and batch paths.
//!
//! A candidate is first repaired with the deterministic notation fixers, then checked
//! in a fixed order. The first remaining violation decides whether one more backend
//! call is worth making. The dispatcher never asks for a second retry.

use serde_json::{Map, Value};

use crate::error::BatchParseError;
use crate::language::is_output_language_mismatch;
use crate::models::OutputLanguage;
use crate::notation::NotationRule;
use crate::parsers::{
    ParsedTranslation, is_truncated_json, parse_plain_translation, parse_text_single_translation,
};
use crate::quality::{is_placeholder_output, looks_incomplete, looks_repetitive};

pub const STRICT_EN_OUTPUT_INSTRUCTION: &str = "### Output language (critical)\n- Write the translation in English only.\n- Do not output Japanese, Chinese or Korean characters (kana, kanji, hanzi, hangul).\n- Proper nouns without an English form must be romanized.";

pub const STRICT_JP_OUTPUT_INSTRUCTION: &str = "### 出力言語（最重要）\n- 訳文は自然な日本語のみで書くこと。\n- 英語の文をそのまま残さないこと。\n- 中国語（簡体字・繁体字）や韓国語で出力しないこと。";

const PLACEHOLDER_INSTRUCTION: &str = "### Output constraint (critical)\n- Output the actual translation of the input text.\n- Never answer with placeholders such as '...' or '<TRANSLATION>'.";

pub fn strict_output_language_instruction(output_language: OutputLanguage) -> &'static str {
    match output_language {
        OutputLanguage::En => STRICT_EN_OUTPUT_INSTRUCTION,
        OutputLanguage::Jp => STRICT_JP_OUTPUT_INSTRUCTION,
    }
}

/// Why a candidate translation cannot be accepted as it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Unparseable { truncated: bool },
    Placeholder,
    OutputLanguage,
    Incomplete,
    Repetitive,
    Notation(NotationRule),
}

impl Violation {
    /// Prompt addition for the single retry; `None` when the violation is final.
    pub fn retry_instruction(self, output_language: OutputLanguage) -> Option<&'static str> {
        match self {
            Violation::Placeholder => Some(PLACEHOLDER_INSTRUCTION),
            Violation::OutputLanguage => Some(strict_output_language_instruction(output_language)),
            Violation::Notation(rule) => Some(rule.retry_instruction()),
            Violation::Unparseable { .. } | Violation::Incomplete | Violation::Repetitive => None,
        }
    }

    /// Label recorded in `backend_call_phases` for the retry call.
    pub fn phase(self) -> &'static str {
        match self {
            Violation::Placeholder => "placeholder_retry",
            Violation::OutputLanguage => "output_language_retry",
            Violation::Notation(_) => "numeric_rule_retry",
            Violation::Unparseable { .. } => "parse_retry",
            Violation::Incomplete | Violation::Repetitive => "retry",
        }
    }

    fn retry_key(self) -> Option<&'static str> {
        match self {
            Violation::Placeholder => Some("placeholder_retry"),
            Violation::OutputLanguage => Some("output_language_retry"),
            Violation::Notation(_) => Some("to_en_numeric_rule_retry"),
            _ => None,
        }
    }

    fn failed_key(self) -> Option<&'static str> {
        match self {
            Violation::Placeholder => Some("placeholder_retry_failed"),
            Violation::OutputLanguage => Some("output_language_retry_failed"),
            Violation::Notation(_) => Some("to_en_numeric_rule_retry_failed"),
            Violation::Incomplete => Some("incomplete_translation"),
            Violation::Repetitive => Some("repetitive_output_detected"),
            Violation::Unparseable { .. } => None,
        }
    }

    /// Notation violations leave a usable translation behind.
    pub fn is_soft(self) -> bool {
        matches!(self, Violation::Notation(_))
    }

    /// Check order of [`inspect`]; lower ranks are reported first.
    pub fn priority(self) -> u8 {
        match self {
            Violation::Unparseable { .. } => 0,
            Violation::Placeholder => 1,
            Violation::OutputLanguage => 2,
            Violation::Incomplete => 3,
            Violation::Repetitive => 4,
            Violation::Notation(_) => 5,
        }
    }

    pub fn message(self, output_language: OutputLanguage) -> String {
        match self {
            Violation::Unparseable { truncated: true } => BatchParseError::Truncated.to_string(),
            Violation::Unparseable { truncated: false } => {
                "could not parse the translation response".to_string()
            }
            Violation::Placeholder => {
                "the model returned a placeholder instead of a translation".to_string()
            }
            Violation::OutputLanguage => match output_language {
                OutputLanguage::En => "translation output was not English".to_string(),
                OutputLanguage::Jp => "translation output was not Japanese".to_string(),
            },
            Violation::Incomplete => "translation looks incomplete".to_string(),
            Violation::Repetitive => "translation repeats itself; the model output looks degenerate".to_string(),
            Violation::Notation(rule) => format!("translation breaks the numeric notation rule ({})", rule.correction_key()),
        }
    }
}

/// Single-translation reading of a raw reply: structured first, plain text as a last resort.
pub fn parse_single_reply(raw: &str) -> Result<ParsedTranslation, Violation> {
    if let Some(parsed) = parse_text_single_translation(raw)
        && !parsed.translation.trim().is_empty()
    {
        return Ok(parsed);
    }
    if is_truncated_json(raw) {
        return Err(Violation::Unparseable { truncated: true });
    }
    parse_plain_translation(raw)
        .map(|translation| ParsedTranslation {
            translation,
            explanation: String::new(),
        })
        .ok_or(Violation::Unparseable { truncated: false })
}

/// A candidate after the deterministic fixers ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub text: String,
    pub corrections: Vec<NotationRule>,
    pub violation: Option<Violation>,
}

pub fn inspect(source: &str, candidate: &str, output_language: OutputLanguage) -> Inspection {
    let candidate = candidate.trim();
    let (text, corrections) = match output_language {
        OutputLanguage::En => NotationRule::fix_all(source, candidate),
        OutputLanguage::Jp => (candidate.to_string(), Vec::new()),
    };
    let violation = if candidate.is_empty() {
        Some(Violation::Unparseable { truncated: false })
    } else if is_placeholder_output(source, &text) {
        Some(Violation::Placeholder)
    } else if is_output_language_mismatch(&text, output_language) {
        Some(Violation::OutputLanguage)
    } else if output_language == OutputLanguage::En && looks_incomplete(source, &text) {
        Some(Violation::Incomplete)
    } else if looks_repetitive(&text) {
        Some(Violation::Repetitive)
    } else if output_language == OutputLanguage::En {
        NotationRule::first_violation(source, &text).map(Violation::Notation)
    } else {
        None
    };
    Inspection {
        text,
        corrections,
        violation,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accepted { text: String, explanation: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Retry {
        violation: Violation,
        instruction: &'static str,
    },
    Done(Resolution),
}

/// Drives one translation attempt: at most one retry, then accept or fail.
#[derive(Debug)]
pub struct RetryDispatcher<'a> {
    source: &'a str,
    output_language: OutputLanguage,
    pending: Option<(Violation, Inspection, String)>,
    retried: bool,
    flags: Vec<&'static str>,
}

impl<'a> RetryDispatcher<'a> {
    pub fn new(source: &'a str, output_language: OutputLanguage) -> Self {
        Self {
            source,
            output_language,
            pending: None,
            retried: false,
            flags: Vec::new(),
        }
    }

    /// Metadata keys that ended up `true`.
    pub fn flags(&self) -> &[&'static str] {
        &self.flags
    }

    pub fn write_flags(&self, metadata: &mut Map<String, Value>) {
        for key in &self.flags {
            metadata.insert((*key).to_string(), Value::Bool(true));
        }
    }

    fn flag(&mut self, key: Option<&'static str>) {
        if let Some(key) = key
            && !self.flags.contains(&key)
        {
            self.flags.push(key);
        }
    }

    fn accept(&mut self, inspection: Inspection, explanation: String) -> Step {
        for rule in &inspection.corrections {
            self.flag(Some(rule.correction_key()));
        }
        Step::Done(Resolution::Accepted {
            text: inspection.text,
            explanation,
        })
    }

    fn fail(&mut self, violation: Violation) -> Step {
        if violation == Violation::OutputLanguage {
            self.flag(Some("output_language_mismatch"));
        }
        Step::Done(Resolution::Failed {
            message: violation.message(self.output_language),
        })
    }

    /// Feeds the parsed reply of the latest call.
    pub fn step(&mut self, candidate: Result<ParsedTranslation, Violation>) -> Step {
        let (inspection, explanation) = match candidate {
            Ok(parsed) => (
                inspect(self.source, &parsed.translation, self.output_language),
                parsed.explanation,
            ),
            Err(violation) => (
                Inspection {
                    text: String::new(),
                    corrections: Vec::new(),
                    violation: Some(violation),
                },
                String::new(),
            ),
        };
        match self.pending.take() {
            Some((first_violation, first, first_explanation)) => self.after_retry(
                first_violation,
                first,
                first_explanation,
                inspection,
                explanation,
            ),
            None => self.first_attempt(inspection, explanation),
        }
    }

    fn first_attempt(&mut self, inspection: Inspection, explanation: String) -> Step {
        let Some(violation) = inspection.violation else {
            return self.accept(inspection, explanation);
        };
        match violation.retry_instruction(self.output_language) {
            Some(instruction) if !self.retried => {
                self.retried = true;
                self.pending = Some((violation, inspection, explanation));
                Step::Retry {
                    violation,
                    instruction,
                }
            }
            _ => {
                self.flag(violation.failed_key());
                self.fail(violation)
            }
        }
    }

    fn after_retry(
        &mut self,
        first_violation: Violation,
        first: Inspection,
        first_explanation: String,
        retried: Inspection,
        explanation: String,
    ) -> Step {
        self.flag(first_violation.retry_key());
        match retried.violation {
            None => self.accept(retried, explanation),
            Some(violation) if violation.is_soft() => {
                self.flag(violation.failed_key());
                self.accept(retried, explanation)
            }
            Some(_) if first_violation.is_soft() => {
                self.flag(first_violation.failed_key());
                self.accept(first, first_explanation)
            }
            Some(violation) => {
                self.flag(first_violation.failed_key());
                self.flag(violation.failed_key());
                self.fail(violation)
            }
        }
    }
}
