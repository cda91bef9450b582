use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLanguage {
    En,
    Jp,
}

impl OutputLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputLanguage::En => "en",
            OutputLanguage::Jp => "jp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "en" | "english" => Some(OutputLanguage::En),
            "jp" | "ja" | "japanese" => Some(OutputLanguage::Jp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStyle {
    Standard,
    Concise,
    Minimal,
}

impl TranslationStyle {
    pub const ALL: [TranslationStyle; 3] = [
        TranslationStyle::Standard,
        TranslationStyle::Concise,
        TranslationStyle::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationStyle::Standard => "standard",
            TranslationStyle::Concise => "concise",
            TranslationStyle::Minimal => "minimal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "standard" => Some(TranslationStyle::Standard),
            "concise" => Some(TranslationStyle::Concise),
            "minimal" => Some(TranslationStyle::Minimal),
            _ => None,
        }
    }

    /// Upper bound of `translation chars / source chars` for English output.
    pub fn length_ratio(&self) -> f64 {
        match self {
            TranslationStyle::Standard => 3.0,
            TranslationStyle::Concise => 2.5,
            TranslationStyle::Minimal => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    pub id: String,
    pub text: String,
    pub location: String,
}

impl TextBlock {
    pub fn new(id: impl Into<String>, text: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationOption {
    pub text: String,
    pub explanation: String,
    pub char_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<TranslationStyle>,
}

impl TranslationOption {
    pub fn new(text: impl Into<String>, explanation: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            char_count: text.chars().count(),
            text,
            explanation: explanation.into(),
            style: None,
        }
    }

    pub fn with_style(mut self, style: TranslationStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn set_text(&mut self, text: String) {
        self.char_count = text.chars().count();
        self.text = text;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextTranslationResult {
    pub source_text: String,
    pub source_char_count: usize,
    pub options: Vec<TranslationOption>,
    pub output_language: OutputLanguage,
    pub detected_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TextTranslationResult {
    pub fn new(source_text: &str, output_language: OutputLanguage, detected_language: &str) -> Self {
        Self {
            source_text: source_text.to_string(),
            source_char_count: source_text.chars().count(),
            options: Vec::new(),
            output_language,
            detected_language: detected_language.to_string(),
            error_message: None,
            metadata: None,
        }
    }

    pub fn failed(
        source_text: &str,
        output_language: OutputLanguage,
        detected_language: &str,
        message: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(source_text, output_language, detected_language);
        result.error_message = Some(message.into());
        result
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none() && !self.options.is_empty()
    }

    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .as_ref()
            .and_then(|map| map.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTranslationResult {
    pub translations: BTreeMap<String, String>,
    pub untranslated_block_ids: Vec<String>,
    pub mismatched_batch_count: usize,
    pub total_blocks: usize,
    pub translated_count: usize,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Reference-file problems met while building prompts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BatchTranslationResult {
    pub fn has_issues(&self) -> bool {
        !self.untranslated_block_ids.is_empty()
            || self.mismatched_batch_count > 0
            || self.cancelled
            || self.error_message.is_some()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_blocks == 0 {
            return 1.0;
        }
        self.translated_count as f64 / self.total_blocks as f64
    }

    pub fn summary(&self) -> String {
        if self.cancelled {
            return format!(
                "Cancelled: {}/{} blocks translated",
                self.translated_count, self.total_blocks
            );
        }
        if !self.has_issues() {
            return format!("Success: all {} blocks translated", self.total_blocks);
        }
        format!(
            "Completed with issues: {}/{} blocks translated ({} untranslated, {} mismatched batches)",
            self.translated_count,
            self.total_blocks,
            self.untranslated_block_ids.len(),
            self.mismatched_batch_count
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranslationStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    pub status: TranslationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub blocks_translated: usize,
    pub blocks_total: usize,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    pub issue_block_ids: Vec<String>,
    pub issue_locations: Vec<String>,
    pub mismatched_batch_count: usize,
}

impl TranslationResult {
    pub fn failed(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: TranslationStatus::Failed,
            output_path: None,
            blocks_translated: 0,
            blocks_total: 0,
            duration,
            error_message: Some(message.into()),
            warnings: Vec::new(),
            issue_block_ids: Vec::new(),
            issue_locations: Vec::new(),
            mismatched_batch_count: 0,
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self {
            status: TranslationStatus::Cancelled,
            error_message: Some("translation cancelled".to_string()),
            ..Self::failed("", duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_summary_reports_each_outcome() {
        let mut result = BatchTranslationResult {
            total_blocks: 3,
            translated_count: 3,
            ..Default::default()
        };
        assert_eq!(result.summary(), "Success: all 3 blocks translated");
        assert!(!result.has_issues());

        result.translated_count = 2;
        result.untranslated_block_ids = vec!["b2".to_string()];
        assert_eq!(
            result.summary(),
            "Completed with issues: 2/3 blocks translated (1 untranslated, 0 mismatched batches)"
        );

        result.cancelled = true;
        assert_eq!(result.summary(), "Cancelled: 2/3 blocks translated");
    }

    #[test]
    fn option_tracks_char_count() {
        let mut option = TranslationOption::new("売上", "");
        assert_eq!(option.char_count, 2);
        option.set_text("Sales".to_string());
        assert_eq!(option.char_count, 5);
    }

    #[test]
    fn status_serializes_upper_case() {
        let value = serde_json::to_value(TranslationStatus::Cancelled).unwrap();
        assert_eq!(value, serde_json::json!("CANCELLED"));
    }
}
