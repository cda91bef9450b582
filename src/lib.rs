use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod backend;
pub mod clock;
pub mod error;
pub mod files;
pub mod language;
pub mod logging;
pub mod models;
pub mod notation;
pub mod parsers;
pub mod prompts;
pub mod quality;
pub mod service;
pub mod settings;
#[cfg(test)]
mod test_util;

pub use backend::{BackendClient, BackendKind, CopilotConfig, LocalConfig, build_backend};
pub use error::{BatchParseError, LocalPromptTooLong, TranslationCancelled};
pub use files::{FileProcessor, PlainTextProcessor};
pub use language::{DetectedLanguage, LanguageDetector};
pub use models::{
    BatchTranslationResult, OutputLanguage, TextBlock, TextTranslationResult, TranslationOption,
    TranslationResult, TranslationStatus, TranslationStyle,
};
pub use prompts::PromptBuilder;
pub use service::{BatchLimits, BatchTranslator, ServiceOptions, TranslationService};
pub use settings::Settings;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Translate this file instead of the text input.
    pub file: Option<String>,
    /// `en` or `jp`; detected from the input when absent.
    pub lang: Option<String>,
    pub style: Option<String>,
    /// Return standard, concise and minimal options for Japanese text.
    pub compare_styles: bool,
    pub references: Vec<String>,
    pub backend: Option<String>,
    pub settings_path: Option<String>,
    pub json: bool,
}

/// Wires a service from settings, optionally forcing a backend kind.
pub fn build_service(settings: &Settings, backend: Option<BackendKind>) -> TranslationService {
    let kind = backend.unwrap_or(settings.backend);
    let client = build_backend(kind, settings.local.clone(), settings.copilot.clone());
    let prompts = PromptBuilder::new(
        settings.prompts_directory.clone(),
        settings.use_bundled_glossary,
    );
    TranslationService::new(Arc::new(client), prompts, settings.service_options())
}

pub async fn run(config: Config, input: Option<String>) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let settings = settings::load_settings(settings_path)?;
    let backend = config
        .backend
        .as_deref()
        .map(|value| {
            BackendKind::parse(value)
                .ok_or_else(|| anyhow!("invalid backend '{}' (expected local or copilot)", value))
        })
        .transpose()?;
    let service = build_service(&settings, backend);
    run_with_service(&service, &config, input).await
}

/// Executes one CLI request against an already built service.
pub async fn run_with_service(
    service: &TranslationService,
    config: &Config,
    input: Option<String>,
) -> Result<String> {
    let output_language = config
        .lang
        .as_deref()
        .map(|value| {
            OutputLanguage::parse(value)
                .ok_or_else(|| anyhow!("invalid language '{}' (expected en or jp)", value))
        })
        .transpose()?;
    let style = config
        .style
        .as_deref()
        .map(|value| {
            TranslationStyle::parse(value).ok_or_else(|| {
                anyhow!(
                    "invalid style '{}' (expected standard, concise or minimal)",
                    value
                )
            })
        })
        .transpose()?;
    let references: Vec<PathBuf> = config.references.iter().map(PathBuf::from).collect();

    if let Some(file) = config.file.as_deref() {
        let result = service
            .translate_file(Path::new(file), output_language, style, &references)
            .await?;
        return if config.json {
            serde_json::to_string_pretty(&result).context("failed to encode result")
        } else {
            Ok(format_file_result(&result))
        };
    }

    let input = input.unwrap_or_default();
    let input = input.trim();
    if input.is_empty() {
        return Err(anyhow!("stdin is empty"));
    }
    let detected = output_language.map(|language| match language {
        OutputLanguage::En => DetectedLanguage::Japanese,
        OutputLanguage::Jp => DetectedLanguage::English,
    });
    let result = if config.compare_styles && style.is_none() {
        service
            .translate_text_with_style_comparison(input, &references, detected, None)
            .await
    } else {
        service
            .translate_text_with_options(input, &references, style, detected, None)
            .await
    };
    if config.json {
        return serde_json::to_string_pretty(&result).context("failed to encode result");
    }
    format_text_result(&result)
}

fn format_text_result(result: &TextTranslationResult) -> Result<String> {
    if let Some(message) = result.error_message.as_deref() {
        return Err(anyhow!("translation failed: {}", message));
    }
    match result.options.as_slice() {
        [] => Err(anyhow!("translation failed: no output")),
        [only] => Ok(only.text.clone()),
        options => Ok(options
            .iter()
            .map(|option| match option.style {
                Some(style) => format!("[{}] {}", style.as_str(), option.text),
                None => option.text.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

fn format_file_result(result: &TranslationResult) -> String {
    let mut lines = Vec::new();
    let status = match result.status {
        TranslationStatus::Completed => "completed",
        TranslationStatus::Failed => "failed",
        TranslationStatus::Cancelled => "cancelled",
    };
    lines.push(format!(
        "status: {} ({}/{} blocks translated)",
        status, result.blocks_translated, result.blocks_total
    ));
    if let Some(path) = result.output_path.as_deref() {
        lines.push(format!("output: {}", path.display()));
    }
    if let Some(message) = result.error_message.as_deref() {
        lines.push(format!("error: {}", message));
    }
    for warning in &result.warnings {
        lines.push(format!("warning: {}", warning));
    }
    if !result.issue_locations.is_empty() {
        lines.push(format!("untranslated: {}", result.issue_locations.join(", ")));
    }
    lines.join("\n")
}
