//! Translation orchestration: single texts, style comparison, block batches and files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendKind, CancelCallback, ChunkCallback};
use crate::error::{TranslationCancelled, is_cancelled};
use crate::files::{FileProcessor, PlainTextProcessor, output_path_for};
use crate::language::{DetectedLanguage, LanguageDetector};
use crate::models::{
    BatchTranslationResult, OutputLanguage, TextBlock, TextTranslationResult, TranslationOption,
    TranslationResult, TranslationStatus, TranslationStyle,
};
use crate::parsers::{
    ParsedTranslation, insert_extra_instruction, is_truncated_json, parse_text_to_en_3style,
    parse_text_to_en_style_subset,
};
use crate::prompts::{BuiltPrompt, PromptBuilder};
use crate::quality::exceeds_length_limit;

pub mod batch;
#[cfg(test)]
pub(crate) mod fake;
pub mod retry;

pub use batch::{BatchLimits, BatchTranslator, create_batches};
pub use retry::{Resolution, RetryDispatcher, Step, Violation, parse_single_reply};

const MAX_ISSUE_LOCATIONS: usize = 24;
const LANGUAGE_SAMPLE_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceOptions {
    /// Budgets for file translation.
    pub file_limits: BatchLimits,
    /// Budgets for interactive multi-text translation.
    pub text_limits: BatchLimits,
    pub request_timeout: Duration,
    pub default_style: TranslationStyle,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            file_limits: BatchLimits::default(),
            text_limits: BatchLimits {
                max_chars_per_batch: 800,
                max_items_per_batch: 20,
            },
            request_timeout: Duration::from_secs(600),
            default_style: TranslationStyle::Concise,
        }
    }
}

/// Backend calls made for one request, reported through result metadata.
#[derive(Debug)]
struct CallLog {
    backend: BackendKind,
    phases: Vec<&'static str>,
    reference_warnings: Vec<String>,
    reference_truncated: bool,
}

impl CallLog {
    fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            phases: Vec::new(),
            reference_warnings: Vec::new(),
            reference_truncated: false,
        }
    }

    fn note_prompt(&mut self, prompt: &BuiltPrompt) {
        for warning in &prompt.reference_warnings {
            if !self.reference_warnings.contains(warning) {
                self.reference_warnings.push(warning.clone());
            }
        }
        self.reference_truncated |= prompt.reference_truncated;
    }

    fn write(&self, metadata: &mut Map<String, Value>) {
        metadata.insert("backend".to_string(), json!(self.backend.as_str()));
        metadata.insert("backend_call_count".to_string(), json!(self.phases.len()));
        metadata.insert("backend_call_phases".to_string(), json!(self.phases));
        if !self.reference_warnings.is_empty() {
            metadata.insert(
                "reference_warnings".to_string(),
                json!(self.reference_warnings),
            );
        }
        if self.reference_truncated {
            metadata.insert("reference_truncated".to_string(), Value::Bool(true));
        }
    }
}

pub struct TranslationService {
    backend: Arc<dyn BackendClient>,
    prompts: Arc<PromptBuilder>,
    detector: LanguageDetector,
    file_batch: BatchTranslator,
    text_batch: BatchTranslator,
    processors: Vec<Box<dyn FileProcessor>>,
    lock: Arc<AsyncMutex<()>>,
    cancel: Arc<AtomicBool>,
    default_style: TranslationStyle,
}

impl TranslationService {
    pub fn new(backend: Arc<dyn BackendClient>, prompts: PromptBuilder, options: ServiceOptions) -> Self {
        let prompts = Arc::new(prompts);
        let lock = Arc::new(AsyncMutex::new(()));
        let cancel = Arc::new(AtomicBool::new(false));
        let batch = |limits: BatchLimits| {
            BatchTranslator::new(backend.clone(), prompts.clone(), limits)
                .with_lock(lock.clone())
                .with_cancel_flag(cancel.clone())
                .with_request_timeout(options.request_timeout)
        };
        let file_batch = batch(options.file_limits);
        let text_batch = batch(options.text_limits);
        Self {
            backend,
            prompts,
            detector: LanguageDetector::new(),
            file_batch,
            text_batch,
            processors: vec![Box::new(PlainTextProcessor)],
            lock,
            cancel,
            default_style: options.default_style,
        }
    }

    /// Registers another processor; it is consulted before the bundled ones.
    pub fn with_processor(mut self, processor: Box<dyn FileProcessor>) -> Self {
        self.processors.insert(0, processor);
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Lock serialising calls to backends that are not concurrency-safe.
    pub fn backend_lock(&self) -> Arc<AsyncMutex<()>> {
        self.lock.clone()
    }

    pub fn detect_language(&self, text: &str) -> DetectedLanguage {
        self.detector.detect(text)
    }

    pub fn cancel(&self) {
        info!("translation cancel requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn clear_cache(&self) {
        self.file_batch.clear_cache();
        self.text_batch.clear_cache();
        self.prompts.clear_cache();
    }

    fn cancel_callback(&self) -> CancelCallback {
        let flag = self.cancel.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    async fn backend_guard(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        if self.backend.kind().is_concurrency_safe() {
            return None;
        }
        Some(self.lock.lock().await)
    }

    async fn call_single(
        &self,
        text: &str,
        prompt: &str,
        reference_files: &[PathBuf],
        on_chunk: Option<ChunkCallback>,
        phase: &'static str,
        log: &mut CallLog,
    ) -> Result<String> {
        if self.is_cancelled() {
            return Err(TranslationCancelled.into());
        }
        log.phases.push(phase);
        let _guard = self.backend_guard().await;
        self.backend.set_cancel_callback(Some(self.cancel_callback()));
        debug!("backend call ({}, phase={})", self.backend.kind().as_str(), phase);
        self.backend
            .translate_single(text, prompt, reference_files, on_chunk)
            .await
    }

    /// Runs the dispatcher until it settles, spending at most one retry call.
    #[allow(clippy::too_many_arguments)]
    async fn resolve<F>(
        &self,
        text: &str,
        output_language: OutputLanguage,
        first: Result<ParsedTranslation, Violation>,
        reference_files: &[PathBuf],
        log: &mut CallLog,
        metadata: &mut Map<String, Value>,
        retry_prompt: F,
    ) -> Result<Resolution>
    where
        F: Fn(&'static str) -> Result<BuiltPrompt>,
    {
        let mut dispatcher = RetryDispatcher::new(text, output_language);
        let mut candidate = first;
        let resolution = loop {
            match dispatcher.step(candidate) {
                Step::Done(resolution) => break resolution,
                Step::Retry {
                    violation,
                    instruction,
                } => {
                    info!("retrying translation ({:?})", violation);
                    let prompt = retry_prompt(instruction)?;
                    log.note_prompt(&prompt);
                    candidate = match self
                        .call_single(text, &prompt.text, reference_files, None, violation.phase(), log)
                        .await
                    {
                        Ok(raw) => parse_single_reply(&raw),
                        Err(err) if violation.is_soft() && !is_cancelled(&err) => {
                            warn!("retry call failed, keeping the first answer: {:#}", err);
                            Err(Violation::Unparseable { truncated: false })
                        }
                        Err(err) => return Err(err),
                    };
                }
            }
        };
        dispatcher.write_flags(metadata);
        Ok(resolution)
    }

    fn finish_text(
        &self,
        text: &str,
        output_language: OutputLanguage,
        detected: DetectedLanguage,
        outcome: Result<TextTranslationResult>,
        log: &CallLog,
    ) -> TextTranslationResult {
        let mut result = match outcome {
            Ok(result) => result,
            Err(err) if is_cancelled(&err) => TextTranslationResult::failed(
                text,
                output_language,
                detected.label(),
                TranslationCancelled.to_string(),
            ),
            Err(err) => {
                warn!("text translation failed: {:#}", err);
                TextTranslationResult::failed(
                    text,
                    output_language,
                    detected.label(),
                    format!("{err:#}"),
                )
            }
        };
        log.write(result.metadata.get_or_insert_with(Map::new));
        result
    }

    /// One translation of `text`. Japanese input goes to English in `style`
    /// (default from settings); anything else goes to Japanese.
    pub async fn translate_text_with_options(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        style: Option<TranslationStyle>,
        detected: Option<DetectedLanguage>,
        on_chunk: Option<ChunkCallback>,
    ) -> TextTranslationResult {
        self.reset_cancel();
        let detected = detected.unwrap_or_else(|| self.detector.detect(text));
        let output_language = detected.output_language();
        let style = style.unwrap_or(self.default_style);
        let mut log = CallLog::new(self.backend.kind());
        let outcome = self
            .single_translation(
                text,
                reference_files,
                style,
                detected,
                output_language,
                on_chunk,
                &mut log,
            )
            .await;
        self.finish_text(text, output_language, detected, outcome, &log)
    }

    #[allow(clippy::too_many_arguments)]
    async fn single_translation(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        style: TranslationStyle,
        detected: DetectedLanguage,
        output_language: OutputLanguage,
        on_chunk: Option<ChunkCallback>,
        log: &mut CallLog,
    ) -> Result<TextTranslationResult> {
        let label = detected.label();
        let build = |extra: Option<&str>| -> Result<BuiltPrompt> {
            match output_language {
                OutputLanguage::En => {
                    self.prompts
                        .build_text_to_en_single(text, style, reference_files, label, extra)
                }
                OutputLanguage::Jp => {
                    let prompt = self.prompts.build_text_to_jp(text, reference_files, label)?;
                    Ok(match extra {
                        Some(extra) => BuiltPrompt {
                            text: insert_extra_instruction(&prompt.text, extra),
                            ..prompt
                        },
                        None => prompt,
                    })
                }
            }
        };

        let prompt = build(None)?;
        log.note_prompt(&prompt);
        let raw = self
            .call_single(text, &prompt.text, reference_files, on_chunk, "initial", log)
            .await?;

        let mut metadata = Map::new();
        let resolution = self
            .resolve(
                text,
                output_language,
                parse_single_reply(&raw),
                reference_files,
                log,
                &mut metadata,
                |instruction| build(Some(instruction)),
            )
            .await?;

        let mut result = TextTranslationResult::new(text, output_language, label);
        match resolution {
            Resolution::Accepted {
                text: translated,
                explanation,
            } => {
                let mut option = TranslationOption::new(translated, explanation);
                if output_language == OutputLanguage::En {
                    if exceeds_length_limit(text, &option.text, style) {
                        metadata.insert("length_limit_exceeded".to_string(), Value::Bool(true));
                    }
                    option = option.with_style(style);
                }
                result.options.push(option);
            }
            Resolution::Failed { message } => result.error_message = Some(message),
        }
        result.metadata = Some(metadata);
        Ok(result)
    }

    /// Standard, concise and minimal English options from one request. Input that is
    /// not Japanese falls back to [`Self::translate_text_with_options`].
    pub async fn translate_text_with_style_comparison(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        detected: Option<DetectedLanguage>,
        on_chunk: Option<ChunkCallback>,
    ) -> TextTranslationResult {
        let detected = detected.unwrap_or_else(|| self.detector.detect(text));
        if detected.output_language() != OutputLanguage::En {
            return self
                .translate_text_with_options(text, reference_files, None, Some(detected), on_chunk)
                .await;
        }
        self.reset_cancel();
        let mut log = CallLog::new(self.backend.kind());
        let outcome = self
            .style_comparison(text, reference_files, detected, on_chunk, &mut log)
            .await;
        self.finish_text(text, OutputLanguage::En, detected, outcome, &log)
    }

    async fn style_comparison(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        detected: DetectedLanguage,
        on_chunk: Option<ChunkCallback>,
        log: &mut CallLog,
    ) -> Result<TextTranslationResult> {
        let label = detected.label();
        let prompt = self
            .prompts
            .build_text_to_en_3style(text, reference_files, label, None)?;
        log.note_prompt(&prompt);
        let raw = self
            .call_single(text, &prompt.text, reference_files, on_chunk, "initial", log)
            .await?;
        let mut by_style = parse_text_to_en_3style(&raw);
        let truncated = is_truncated_json(&raw);

        let missing: Vec<TranslationStyle> = TranslationStyle::ALL
            .into_iter()
            .filter(|style| !by_style.contains_key(style))
            .collect();
        if !missing.is_empty() {
            info!(
                "style reply missed {:?}; requesting them separately",
                missing
            );
            let prompt = self.prompts.build_text_to_en_missing_styles(
                text,
                &missing,
                reference_files,
                label,
                None,
            )?;
            log.note_prompt(&prompt);
            let raw = self
                .call_single(text, &prompt.text, reference_files, None, "missing_styles", log)
                .await?;
            for (style, parsed) in parse_text_to_en_style_subset(&raw, &missing) {
                by_style.entry(style).or_insert(parsed);
            }
        }

        let mut result = TextTranslationResult::new(text, OutputLanguage::En, label);
        if by_style.is_empty() {
            result.error_message =
                Some(Violation::Unparseable { truncated }.message(OutputLanguage::En));
            return Ok(result);
        }

        let mut metadata = Map::new();
        let mut attempts = Vec::new();
        let mut retries: Vec<(Violation, &'static str)> = Vec::new();
        for style in TranslationStyle::ALL {
            let Some(parsed) = by_style.remove(&style) else {
                continue;
            };
            let mut dispatcher = RetryDispatcher::new(text, OutputLanguage::En);
            let step = dispatcher.step(Ok(parsed));
            if let Step::Retry {
                violation,
                instruction,
            } = step
            {
                retries.push((violation, instruction));
            }
            attempts.push((style, dispatcher, step));
        }

        // One retry covers every style; the worst violation names the phase.
        let mut retry_error = None;
        retries.sort_by_key(|(violation, _)| violation.priority());
        if let Some(&(violation, _)) = retries.first() {
            let mut instructions: Vec<&str> = Vec::new();
            for (_, instruction) in &retries {
                if !instructions.contains(instruction) {
                    instructions.push(*instruction);
                }
            }
            info!("retrying style comparison ({:?})", violation);
            let combined = instructions.join("\n\n");
            let prompt = self.prompts.build_text_to_en_3style(
                text,
                reference_files,
                label,
                Some(combined.as_str()),
            )?;
            log.note_prompt(&prompt);
            let (retried, truncated) = match self
                .call_single(text, &prompt.text, reference_files, None, violation.phase(), log)
                .await
            {
                Ok(raw) => (parse_text_to_en_3style(&raw), is_truncated_json(&raw)),
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    warn!("style retry call failed, keeping first answers: {:#}", err);
                    retry_error = Some(format!("{err:#}"));
                    (Default::default(), false)
                }
            };
            for (style, dispatcher, step) in &mut attempts {
                if matches!(step, Step::Retry { .. }) {
                    let candidate = retried
                        .get(&*style)
                        .cloned()
                        .ok_or(Violation::Unparseable { truncated });
                    *step = dispatcher.step(candidate);
                }
            }
        }

        let mut failures = Vec::new();
        for (style, dispatcher, step) in attempts {
            dispatcher.write_flags(&mut metadata);
            match step {
                Step::Done(Resolution::Accepted {
                    text: translated,
                    explanation,
                }) => {
                    if exceeds_length_limit(text, &translated, style) {
                        metadata.insert("length_limit_exceeded".to_string(), Value::Bool(true));
                    }
                    result
                        .options
                        .push(TranslationOption::new(translated, explanation).with_style(style));
                }
                Step::Done(Resolution::Failed { message }) => {
                    debug!("{} option dropped: {}", style.as_str(), message);
                    failures.push(message);
                }
                Step::Retry { violation, .. } => {
                    failures.push(violation.message(OutputLanguage::En));
                }
            }
        }
        if result.options.is_empty() {
            result.error_message = retry_error.or_else(|| failures.into_iter().next());
        }
        result.metadata = Some(metadata);
        Ok(result)
    }

    /// Several short texts through the interactive batch budgets, in input order.
    pub async fn translate_texts(
        &self,
        texts: &[String],
        reference_files: &[PathBuf],
        output_language: OutputLanguage,
        style: Option<TranslationStyle>,
    ) -> BatchTranslationResult {
        self.reset_cancel();
        self.text_batch.clear_cache();
        let blocks: Vec<TextBlock> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                TextBlock::new(format!("t{}", index + 1), text.clone(), format!("item {}", index + 1))
            })
            .collect();
        self.text_batch
            .translate_blocks_with_result(
                &blocks,
                reference_files,
                output_language,
                style.unwrap_or(self.default_style),
                false,
            )
            .await
    }

    fn processor_for(&self, path: &Path) -> Option<&dyn FileProcessor> {
        self.processors
            .iter()
            .find(|processor| processor.supports(path))
            .map(|processor| processor.as_ref())
    }

    /// Translates a document into a sibling `<stem>_translated` file.
    ///
    /// Only an unsupported file type is an error; every other failure is reported
    /// through the returned [`TranslationResult`].
    pub async fn translate_file(
        &self,
        input: &Path,
        output_language: Option<OutputLanguage>,
        style: Option<TranslationStyle>,
        reference_files: &[PathBuf],
    ) -> Result<TranslationResult> {
        let processor = self
            .processor_for(input)
            .ok_or_else(|| anyhow!("unsupported file type: {}", input.display()))?;
        let started = Instant::now();
        self.reset_cancel();
        self.file_batch.clear_cache();

        let blocks = match processor.extract_text_blocks(input) {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!("failed to extract {}: {:#}", input.display(), err);
                return Ok(TranslationResult::failed(format!("{err:#}"), started.elapsed()));
            }
        };
        if blocks.is_empty() {
            return Ok(TranslationResult::failed(
                "no translatable text found",
                started.elapsed(),
            ));
        }

        let output_language = output_language.unwrap_or_else(|| {
            let sample: String = blocks
                .iter()
                .flat_map(|block| block.text.chars().chain(std::iter::once('\n')))
                .take(LANGUAGE_SAMPLE_CHARS)
                .collect();
            self.detector.detect(&sample).output_language()
        });
        let style = style.unwrap_or(self.default_style);
        info!(
            "translating {} ({} blocks, processor={}) to {}",
            input.display(),
            blocks.len(),
            processor.name(),
            output_language.as_str()
        );

        let batch = self
            .file_batch
            .translate_blocks_with_result(&blocks, reference_files, output_language, style, true)
            .await;
        let mut result = TranslationResult {
            blocks_total: blocks.len(),
            blocks_translated: batch.translated_count,
            mismatched_batch_count: batch.mismatched_batch_count,
            warnings: batch.warnings.clone(),
            issue_block_ids: batch.untranslated_block_ids.clone(),
            issue_locations: issue_locations(&blocks, &batch.untranslated_block_ids),
            ..TranslationResult::failed("", started.elapsed())
        };
        if batch.cancelled {
            info!("translation of {} cancelled", input.display());
            result.status = TranslationStatus::Cancelled;
            result.error_message = Some(TranslationCancelled.to_string());
            return Ok(result);
        }
        if let Some(message) = batch.error_message.clone() {
            result.error_message = Some(message);
            return Ok(result);
        }

        let output_path = output_path_for(input);
        if let Err(err) = processor.apply_translations(input, &output_path, &batch.translations) {
            warn!("failed to write {}: {:#}", output_path.display(), err);
            result.error_message = Some(format!("{err:#}"));
            result.duration = started.elapsed();
            return Ok(result);
        }
        if batch.has_issues() {
            result.warnings.push(batch.summary());
        }
        info!("{} -> {} ({})", input.display(), output_path.display(), batch.summary());
        result.status = TranslationStatus::Completed;
        result.error_message = None;
        result.output_path = Some(output_path);
        result.duration = started.elapsed();
        Ok(result)
    }
}

fn issue_locations(blocks: &[TextBlock], ids: &[String]) -> Vec<String> {
    let mut locations: Vec<String> = Vec::new();
    for block in blocks.iter().filter(|block| ids.contains(&block.id)) {
        if locations.len() >= MAX_ISSUE_LOCATIONS {
            break;
        }
        if !block.location.is_empty() && !locations.contains(&block.location) {
            locations.push(block.location.clone());
        }
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fake::FakeBackend;
    use std::fs;

    fn service(backend: Arc<FakeBackend>) -> TranslationService {
        TranslationService::new(backend, PromptBuilder::new(None, false), ServiceOptions::default())
    }

    fn phases(result: &TextTranslationResult) -> Vec<String> {
        result
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("backend_call_phases"))
            .and_then(Value::as_array)
            .map(|phases| {
                phases
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn texts(result: &TextTranslationResult) -> Vec<&str> {
        result.options.iter().map(|option| option.text.as_str()).collect()
    }

    #[tokio::test]
    async fn large_unit_mistake_is_retried_once() {
        let backend = FakeBackend::singles(
            BackendKind::Local,
            &["Net sales were 22,384 billion yen.", "Net sales were 22,385 oku yen."],
        );
        let service = service(backend.clone());
        let result = service
            .translate_text_with_options("売上高は2兆2,385億円となりました。", &[], None, None, None)
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(texts(&result), ["Net sales were 22,385 oku yen."]);
        assert_eq!(phases(&result), ["initial", "numeric_rule_retry"]);
        assert!(result.metadata_flag("to_en_numeric_rule_retry"));
        assert_eq!(
            result.metadata.as_ref().and_then(|m| m.get("backend")),
            Some(&json!("local"))
        );
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Do not use 'billion'"));
    }

    #[tokio::test]
    async fn k_notation_and_negatives_are_fixed_locally() {
        let backend = FakeBackend::singles(
            BackendKind::Local,
            &[
                "The starting salary is 220,000 yen.",
                "Operating income was -50 oku yen.",
                "YoY change was -50.",
            ],
        );
        let service = service(backend);

        let salary = service
            .translate_text_with_options("初任給は22万円です。", &[], None, None, None)
            .await;
        assert_eq!(texts(&salary), ["The starting salary is 220k yen."]);
        assert!(salary.metadata_flag("to_en_k_correction"));
        assert_eq!(phases(&salary), ["initial"]);

        let loss = service
            .translate_text_with_options("営業利益は▲50億円。", &[], None, None, None)
            .await;
        assert_eq!(texts(&loss), ["Operating income was (50) oku yen."]);
        assert!(loss.metadata_flag("to_en_negative_correction"));
        assert_eq!(phases(&loss), ["initial"]);

        let change = service
            .translate_text_with_options("前年差は▲50です。", &[], None, None, None)
            .await;
        assert_eq!(texts(&change), ["YoY change was (50)."]);
    }

    #[tokio::test]
    async fn style_is_attached_to_english_options() {
        let backend = FakeBackend::singles(BackendKind::Local, &["Sales in Jan."]);
        let service = service(backend);
        let result = service
            .translate_text_with_options(
                "1月の売上",
                &[],
                Some(TranslationStyle::Minimal),
                None,
                None,
            )
            .await;
        assert_eq!(result.options[0].style, Some(TranslationStyle::Minimal));
        assert_eq!(result.output_language, OutputLanguage::En);
        assert_eq!(result.detected_language, "日本語");
    }

    #[tokio::test]
    async fn japanese_reply_for_english_output_fails_after_one_retry() {
        let backend = FakeBackend::singles(
            BackendKind::Copilot,
            &["売上高は増加しました。", "売上は増えました。"],
        );
        let service = service(backend.clone());
        let result = service
            .translate_text_with_options("売上高は増加しました。", &[], None, None, None)
            .await;

        assert!(result.options.is_empty());
        assert_eq!(
            result.error_message.as_deref(),
            Some("translation output was not English")
        );
        assert_eq!(phases(&result), ["initial", "output_language_retry"]);
        assert!(result.metadata_flag("output_language_mismatch"));
        assert!(backend.prompts()[1].contains("Output language (critical)"));
    }

    #[tokio::test]
    async fn english_input_goes_to_japanese() {
        let backend = FakeBackend::singles(BackendKind::Local, &["売上高は増加しました。"]);
        let service = service(backend);
        let result = service
            .translate_text_with_options("Net sales increased.", &[], None, None, None)
            .await;
        assert_eq!(result.output_language, OutputLanguage::Jp);
        assert_eq!(texts(&result), ["売上高は増加しました。"]);
        assert_eq!(result.options[0].style, None);
    }

    #[tokio::test]
    async fn backend_errors_become_error_messages() {
        let backend = FakeBackend::singles(BackendKind::Local, &[]);
        let service = service(backend);
        let result = service
            .translate_text_with_options("売上高", &[], None, None, None)
            .await;
        assert!(!result.is_success());
        assert_eq!(result.error_message.as_deref(), Some("no single replies left"));
        assert_eq!(phases(&result), ["initial"]);
    }

    #[tokio::test]
    async fn missing_styles_are_requested_separately() {
        let backend = FakeBackend::singles(
            BackendKind::Local,
            &[
                r#"{"options": [{"style": "standard", "translation": "Net sales increased year on year.", "explanation": "Full sentence."}]}"#,
                r#"{"options": [{"style": "minimal", "translation": "Sales up YoY", "explanation": ""}, {"style": "concise", "translation": "Net sales rose YoY.", "explanation": ""}]}"#,
            ],
        );
        let service = service(backend);
        let result = service
            .translate_text_with_style_comparison("売上高は前年比で増加しました。", &[], None, None)
            .await;

        assert!(result.is_success(), "{result:?}");
        let styles: Vec<_> = result.options.iter().map(|option| option.style).collect();
        assert_eq!(
            styles,
            [
                Some(TranslationStyle::Standard),
                Some(TranslationStyle::Concise),
                Some(TranslationStyle::Minimal)
            ]
        );
        assert_eq!(
            texts(&result),
            ["Net sales increased year on year.", "Net sales rose YoY.", "Sales up YoY"]
        );
        assert_eq!(result.options[0].explanation, "Full sentence.");
        assert_eq!(phases(&result), ["initial", "missing_styles"]);
    }

    fn three_styles(standard: &str, concise: &str, minimal: &str) -> String {
        json!({
            "options": [
                {"style": "standard", "translation": standard, "explanation": ""},
                {"style": "concise", "translation": concise, "explanation": ""},
                {"style": "minimal", "translation": minimal, "explanation": ""},
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn style_comparison_spends_one_retry_for_all_styles() {
        let wrong = "Net sales were 22,384 billion yen.";
        let right = "Net sales were 22,385 oku yen.";
        let first = three_styles(wrong, wrong, wrong);
        let second = three_styles(right, right, right);
        let backend = FakeBackend::singles(BackendKind::Local, &[&first, &second]);
        let service = service(backend.clone());
        let result = service
            .translate_text_with_style_comparison("売上高は2兆2,385億円となりました。", &[], None, None)
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(texts(&result), [right, right, right]);
        assert_eq!(phases(&result), ["initial", "numeric_rule_retry"]);
        assert!(result.metadata_flag("to_en_numeric_rule_retry"));
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Do not use 'billion'"));
    }

    #[tokio::test]
    async fn style_retry_combines_instructions_and_keeps_soft_first_answers() {
        let wrong = "Net sales were 22,384 billion yen.";
        let first = three_styles(wrong, "売上高は2兆2,385億円です。", wrong);
        let second = three_styles("売上高です。", "Net sales were 22,385 oku yen.", "売上高です。");
        let backend = FakeBackend::singles(BackendKind::Local, &[&first, &second]);
        let service = service(backend.clone());
        let result = service
            .translate_text_with_style_comparison("売上高は2兆2,385億円となりました。", &[], None, None)
            .await;

        assert_eq!(phases(&result), ["initial", "output_language_retry"]);
        assert_eq!(texts(&result), [wrong, "Net sales were 22,385 oku yen.", wrong]);
        assert!(result.metadata_flag("output_language_retry"));
        assert!(result.metadata_flag("to_en_numeric_rule_retry_failed"));
        let prompts = backend.prompts();
        assert!(prompts[1].contains("Output language (critical)"));
        assert!(prompts[1].contains("Do not use 'billion'"));
    }

    #[tokio::test]
    async fn failed_retry_call_keeps_the_first_answer() {
        let backend =
            FakeBackend::singles(BackendKind::Local, &["Net sales were 22,384 billion yen."]);
        let service = service(backend);
        let result = service
            .translate_text_with_options("売上高は2兆2,385億円となりました。", &[], None, None, None)
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(texts(&result), ["Net sales were 22,384 billion yen."]);
        assert_eq!(phases(&result), ["initial", "numeric_rule_retry"]);
        assert!(result.metadata_flag("to_en_numeric_rule_retry_failed"));
    }

    #[tokio::test]
    async fn style_comparison_for_english_input_is_a_single_translation() {
        let backend = FakeBackend::singles(BackendKind::Local, &["営業利益"]);
        let service = service(backend);
        let result = service
            .translate_text_with_style_comparison("Operating profit", &[], None, None)
            .await;
        assert_eq!(texts(&result), ["営業利益"]);
        assert_eq!(phases(&result), ["initial"]);
    }

    fn dictionary(texts: &[String], _prompt: &str) -> Result<Vec<String>> {
        Ok(texts
            .iter()
            .map(|text| match text.as_str() {
                "売上高" => "Net sales".to_string(),
                "営業利益" => "Operating profit".to_string(),
                other => other.to_string(),
            })
            .collect())
    }

    #[tokio::test]
    async fn text_files_are_translated_next_to_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("summary.txt");
        fs::write(&input, "売上高\n\n営業利益\n").unwrap();

        let service = service(FakeBackend::batches(BackendKind::Local, dictionary));
        let result = service.translate_file(&input, None, None, &[]).await.unwrap();

        assert_eq!(result.status, TranslationStatus::Completed, "{result:?}");
        assert_eq!(result.blocks_total, 2);
        assert_eq!(result.blocks_translated, 2);
        let output = dir.path().join("summary_translated.txt");
        assert_eq!(result.output_path.as_deref(), Some(output.as_path()));
        assert_eq!(fs::read_to_string(output).unwrap(), "Net sales\n\nOperating profit\n");
    }

    #[tokio::test]
    async fn untranslated_blocks_are_reported_by_location() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("notes.md");
        fs::write(&input, "売上高\n\n未知の見出し\n").unwrap();

        let service = service(FakeBackend::batches(BackendKind::Local, dictionary));
        let result = service.translate_file(&input, None, None, &[]).await.unwrap();

        assert_eq!(result.status, TranslationStatus::Completed);
        assert_eq!(result.issue_block_ids, ["p2"]);
        assert_eq!(result.issue_locations, ["line 3"]);
        assert_eq!(result.blocks_translated, 1);
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn empty_and_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(FakeBackend::batches(BackendKind::Local, dictionary));

        let empty = dir.path().join("empty.txt");
        fs::write(&empty, "\n\n").unwrap();
        let result = service.translate_file(&empty, None, None, &[]).await.unwrap();
        assert_eq!(result.status, TranslationStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("no translatable text found"));

        let deck = dir.path().join("deck.pptx");
        fs::write(&deck, "").unwrap();
        assert!(service.translate_file(&deck, None, None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn short_texts_use_generated_ids() {
        let backend = FakeBackend::batches(BackendKind::Local, dictionary);
        let service = service(backend);
        let result = service
            .translate_texts(
                &["売上高".to_string(), "営業利益".to_string()],
                &[],
                OutputLanguage::En,
                None,
            )
            .await;
        assert_eq!(result.translations.get("t1").map(String::as_str), Some("Net sales"));
        assert_eq!(
            result.translations.get("t2").map(String::as_str),
            Some("Operating profit")
        );
    }
}
