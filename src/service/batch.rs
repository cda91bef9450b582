//! Block-level batch translation for files.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::retry::strict_output_language_instruction;
use crate::backend::{BackendClient, BackendFuture, CancelCallback};
use crate::error::{TranslationCancelled, is_cancelled, is_prompt_too_long};
use crate::language::{LanguageDetector, contains_hangul, is_output_language_mismatch};
use crate::models::{BatchTranslationResult, OutputLanguage, TextBlock, TranslationStyle};
use crate::notation::NotationRule;
use crate::parsers::{clean_batch_translation, insert_extra_instruction, looks_like_split_request};
use crate::prompts::PromptBuilder;

pub const DEFAULT_MAX_CHARS_PER_BATCH: usize = 1000;
pub const DEFAULT_MAX_ITEMS_PER_BATCH: usize = 40;

const MIN_SPLIT_CHARS: usize = 300;
const MAX_SPLIT_DEPTH: usize = 2;
const UNTRANSLATED_RETRY_MAX_CHARS: usize = 800;
const NUMERIC_RETRY_MAX_ITEMS: usize = 20;
const NUMERIC_RETRY_MAX_CHARS: usize = 2000;
const UNTRANSLATED_JAPANESE_RATIO: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_chars_per_batch: usize,
    pub max_items_per_batch: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_chars_per_batch: DEFAULT_MAX_CHARS_PER_BATCH,
            max_items_per_batch: DEFAULT_MAX_ITEMS_PER_BATCH,
        }
    }
}

/// Groups consecutive blocks under both budgets. A block larger than `max_chars` travels alone.
pub fn create_batches(blocks: &[TextBlock], max_chars: usize, max_items: usize) -> Vec<&[TextBlock]> {
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;
    for (index, block) in blocks.iter().enumerate() {
        let size = block.text.chars().count();
        let count = index - start;
        if count > 0 && (chars + size > max_chars || count >= max_items) {
            batches.push(&blocks[start..index]);
            start = index;
            chars = 0;
        }
        chars += size;
    }
    if start < blocks.len() {
        batches.push(&blocks[start..]);
    }
    batches
}

#[derive(Debug, Clone, Copy)]
struct RunOptions<'a> {
    reference_files: &'a [PathBuf],
    output_language: OutputLanguage,
    style: TranslationStyle,
    include_item_ids: bool,
}

impl RunOptions<'_> {
    fn cache_key(&self, text: &str) -> String {
        let style = match self.output_language {
            OutputLanguage::En => self.style.as_str(),
            OutputLanguage::Jp => "",
        };
        format!("{}\0{}\0{}", self.output_language.as_str(), style, text.trim())
    }
}

pub struct BatchTranslator {
    backend: Arc<dyn BackendClient>,
    prompts: Arc<PromptBuilder>,
    limits: BatchLimits,
    request_timeout: Option<Duration>,
    lock: Option<Arc<AsyncMutex<()>>>,
    cancel: Arc<AtomicBool>,
    detector: LanguageDetector,
    cache: Mutex<HashMap<String, String>>,
}

impl BatchTranslator {
    pub fn new(backend: Arc<dyn BackendClient>, prompts: Arc<PromptBuilder>, limits: BatchLimits) -> Self {
        Self {
            backend,
            prompts,
            limits,
            request_timeout: None,
            lock: None,
            cancel: Arc::new(AtomicBool::new(false)),
            detector: LanguageDetector::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Lock taken around calls to backends that cannot run concurrently.
    pub fn with_lock(mut self, lock: Arc<AsyncMutex<()>>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forgets translations from the previous run.
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    /// Translations keyed by block id. Backend failures propagate; cancellation is
    /// reported as [`TranslationCancelled`].
    pub async fn translate_blocks(
        &self,
        blocks: &[TextBlock],
        reference_files: &[PathBuf],
        output_language: OutputLanguage,
        style: TranslationStyle,
        include_item_ids: bool,
    ) -> Result<BTreeMap<String, String>> {
        let options = RunOptions {
            reference_files,
            output_language,
            style,
            include_item_ids,
        };
        let result = self
            .run(blocks, options, self.limits.max_chars_per_batch, 0)
            .await?;
        if result.cancelled {
            return Err(TranslationCancelled.into());
        }
        Ok(result.translations)
    }

    /// Never fails: errors end up in `error_message` and every block id is present,
    /// with its source text when no translation was obtained.
    pub async fn translate_blocks_with_result(
        &self,
        blocks: &[TextBlock],
        reference_files: &[PathBuf],
        output_language: OutputLanguage,
        style: TranslationStyle,
        include_item_ids: bool,
    ) -> BatchTranslationResult {
        let options = RunOptions {
            reference_files,
            output_language,
            style,
            include_item_ids,
        };
        match self
            .run(blocks, options, self.limits.max_chars_per_batch, 0)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!("batch translation failed: {:#}", err);
                let mut result = BatchTranslationResult {
                    total_blocks: blocks.len(),
                    cancelled: is_cancelled(&err),
                    error_message: Some(format!("{err:#}")),
                    ..Default::default()
                };
                for block in blocks {
                    result
                        .translations
                        .insert(block.id.clone(), block.text.clone());
                    result.untranslated_block_ids.push(block.id.clone());
                }
                result
            }
        }
    }

    fn run<'a>(
        &'a self,
        blocks: &'a [TextBlock],
        options: RunOptions<'a>,
        max_chars: usize,
        depth: usize,
    ) -> BackendFuture<'a, BatchTranslationResult> {
        Box::pin(async move {
            let mut result = BatchTranslationResult {
                total_blocks: blocks.len(),
                ..Default::default()
            };
            let batches = create_batches(blocks, max_chars, self.limits.max_items_per_batch);
            let total = batches.len();
            debug!(
                "translating {} block(s) in {} batch(es) (max_chars={}, depth={})",
                blocks.len(),
                total,
                max_chars,
                depth
            );

            for (index, batch) in batches.into_iter().enumerate() {
                if self.is_cancelled() {
                    result.cancelled = true;
                    break;
                }
                let pending = self.take_cached(batch, options, &mut result.translations);
                if pending.is_empty() {
                    continue;
                }
                let mut unique: Vec<String> = Vec::new();
                let mut positions: HashMap<&str, usize> = HashMap::new();
                for block in &pending {
                    positions.entry(block.text.as_str()).or_insert_with(|| {
                        unique.push(block.text.clone());
                        unique.len() - 1
                    });
                }

                let prompt = self.prompts.build_batch(
                    &unique,
                    !options.reference_files.is_empty(),
                    options.output_language,
                    options.style,
                    options.include_item_ids,
                    options.reference_files,
                )?;
                push_unique(&mut result.warnings, prompt.reference_warnings);

                let reply = self.call(&unique, &prompt.text, options, index > 0).await;
                let split_reason = match &reply {
                    Ok(items) if looks_like_split_request(items) => {
                        Some("backend asked to split the request")
                    }
                    Ok(_) => None,
                    Err(err) if is_cancelled(err) => {
                        result.cancelled = true;
                        break;
                    }
                    Err(err) if is_prompt_too_long(err) => Some("prompt too long"),
                    Err(_) => None,
                };
                if let Some(reason) = split_reason
                    && depth < MAX_SPLIT_DEPTH
                    && max_chars > MIN_SPLIT_CHARS
                {
                    let reduced = (max_chars / 2).max(MIN_SPLIT_CHARS);
                    info!(
                        "batch {}/{}: {}; retrying with max_chars {} -> {}",
                        index + 1,
                        total,
                        reason,
                        max_chars,
                        reduced
                    );
                    let owned: Vec<TextBlock> = pending.iter().map(|block| (*block).clone()).collect();
                    let sub = self.run(&owned, options, reduced, depth + 1).await?;
                    let stop = sub.cancelled;
                    absorb(&mut result, sub, true);
                    if stop {
                        result.cancelled = true;
                        break;
                    }
                    continue;
                }
                let items = match reply {
                    Ok(_) if split_reason.is_some() => {
                        warn!(
                            "batch {}/{}: backend keeps asking to split; leaving {} item(s) untranslated",
                            index + 1,
                            total,
                            unique.len()
                        );
                        vec![String::new(); unique.len()]
                    }
                    Ok(items) => items,
                    Err(err) => {
                        return Err(err.context(format!("batch {}/{} failed", index + 1, total)));
                    }
                };

                let items = Self::align(items, unique.len(), depth, &mut result);
                let settled = self.settle(&unique, items, options, max_chars).await;

                for block in pending {
                    let text = positions
                        .get(block.text.as_str())
                        .and_then(|&position| settled.get(position))
                        .filter(|text| !text.is_empty());
                    match text {
                        Some(text) => {
                            self.cache()
                                .insert(options.cache_key(&block.text), text.clone());
                            result.translations.insert(block.id.clone(), text.clone());
                        }
                        None => {
                            result
                                .translations
                                .insert(block.id.clone(), block.text.clone());
                            result.untranslated_block_ids.push(block.id.clone());
                        }
                    }
                }
            }

            if depth == 0
                && !result.cancelled
                && result.mismatched_batch_count == 0
                && !result.untranslated_block_ids.is_empty()
            {
                self.retry_untranslated(blocks, options, max_chars, &mut result)
                    .await;
            }

            result.translated_count = result
                .translations
                .len()
                .saturating_sub(result.untranslated_block_ids.len());
            Ok(result)
        })
    }

    fn take_cached<'b>(
        &self,
        batch: &'b [TextBlock],
        options: RunOptions<'_>,
        translations: &mut BTreeMap<String, String>,
    ) -> Vec<&'b TextBlock> {
        let cache = self.cache();
        batch
            .iter()
            .filter(|block| match cache.get(&options.cache_key(&block.text)) {
                Some(hit) => {
                    debug!("cache hit for block {}", block.id);
                    translations.insert(block.id.clone(), hit.clone());
                    false
                }
                None => true,
            })
            .collect()
    }

    fn cancel_callback(&self) -> CancelCallback {
        let flag = self.cancel.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    async fn call(
        &self,
        texts: &[String],
        prompt: &str,
        options: RunOptions<'_>,
        skip_clear_wait: bool,
    ) -> Result<Vec<String>> {
        if self.is_cancelled() {
            return Err(TranslationCancelled.into());
        }
        let _guard = match &self.lock {
            Some(lock) if !self.backend.kind().is_concurrency_safe() => Some(lock.lock().await),
            _ => None,
        };
        self.backend.set_cancel_callback(Some(self.cancel_callback()));
        self.backend
            .translate_sync(
                texts,
                prompt,
                options.reference_files,
                skip_clear_wait,
                self.request_timeout,
                options.include_item_ids,
            )
            .await
    }

    /// One extra call for `sources` with `instruction` added. `None` when it failed.
    async fn repair(
        &self,
        sources: &[String],
        instruction: &str,
        options: RunOptions<'_>,
    ) -> Option<Vec<String>> {
        if self.is_cancelled() {
            return None;
        }
        let prompt = match self.prompts.build_batch(
            sources,
            !options.reference_files.is_empty(),
            options.output_language,
            options.style,
            options.include_item_ids,
            options.reference_files,
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!("failed to build repair prompt: {:#}", err);
                return None;
            }
        };
        let prompt = insert_extra_instruction(&prompt.text, instruction);
        match self.call(sources, &prompt, options, true).await {
            Ok(items) => Some(items),
            Err(err) => {
                if !is_cancelled(&err) {
                    warn!("repair call failed: {:#}", err);
                }
                None
            }
        }
    }

    fn align(
        mut items: Vec<String>,
        expected: usize,
        depth: usize,
        result: &mut BatchTranslationResult,
    ) -> Vec<String> {
        if items.len() == expected {
            return items;
        }
        result.mismatched_batch_count += 1;
        warn!(
            "batch returned {} item(s), expected {}",
            items.len(),
            expected
        );
        if items.len() > expected && depth > 0 {
            return vec![String::new(); expected];
        }
        items.resize(expected, String::new());
        items
    }

    /// Cleans replies and spends the per-batch repair calls. Empty entries mean "no translation".
    async fn settle(
        &self,
        sources: &[String],
        items: Vec<String>,
        options: RunOptions<'_>,
        max_chars: usize,
    ) -> Vec<String> {
        let language = options.output_language;
        let mut settled: Vec<String> = items
            .iter()
            .map(|item| clean_batch_translation(item))
            .collect();

        let mut language_retry = Vec::new();
        for (index, text) in settled.iter_mut().enumerate() {
            if text.is_empty() {
                continue;
            }
            if is_output_language_mismatch(text, language) {
                language_retry.push(index);
                text.clear();
            } else if self.looks_untranslated(&sources[index], text, language) {
                text.clear();
            }
        }
        if !language_retry.is_empty() {
            info!(
                "retrying {} item(s) with the wrong output language",
                language_retry.len()
            );
            let retry_sources: Vec<String> = language_retry
                .iter()
                .map(|&index| sources[index].clone())
                .collect();
            if let Some(repaired) = self
                .repair(
                    &retry_sources,
                    strict_output_language_instruction(language),
                    options,
                )
                .await
            {
                for (&index, candidate) in language_retry.iter().zip(repaired) {
                    let candidate = clean_batch_translation(&candidate);
                    if !candidate.is_empty() && !is_output_language_mismatch(&candidate, language) {
                        settled[index] = candidate;
                    }
                }
            }
        }

        if language == OutputLanguage::En {
            self.settle_notation(sources, &mut settled, options, max_chars)
                .await;
        }
        settled
    }

    async fn settle_notation(
        &self,
        sources: &[String],
        settled: &mut [String],
        options: RunOptions<'_>,
        max_chars: usize,
    ) {
        let budget = max_chars.min(NUMERIC_RETRY_MAX_CHARS);
        let mut selected: Vec<usize> = Vec::new();
        let mut rules: Vec<NotationRule> = Vec::new();
        let mut chars = 0usize;
        for (index, text) in settled.iter_mut().enumerate() {
            if text.is_empty() {
                continue;
            }
            let (fixed, applied) = NotationRule::fix_all(&sources[index], text);
            if !applied.is_empty() {
                debug!("notation fixed for item {}: {:?}", index + 1, applied);
                *text = fixed;
            }
            let Some(rule) = NotationRule::first_violation(&sources[index], text) else {
                continue;
            };
            let size = sources[index].chars().count();
            if selected.len() >= NUMERIC_RETRY_MAX_ITEMS
                || (!selected.is_empty() && chars + size > budget)
            {
                continue;
            }
            chars += size;
            selected.push(index);
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
        if selected.is_empty() {
            return;
        }
        info!("retrying {} item(s) for numeric notation", selected.len());
        let instruction = rules
            .iter()
            .map(|rule| rule.retry_instruction())
            .collect::<Vec<_>>()
            .join("\n");
        let retry_sources: Vec<String> = selected.iter().map(|&index| sources[index].clone()).collect();
        let Some(repaired) = self.repair(&retry_sources, &instruction, options).await else {
            return;
        };
        for (&index, candidate) in selected.iter().zip(repaired) {
            let candidate = clean_batch_translation(&candidate);
            if candidate.is_empty() || is_output_language_mismatch(&candidate, OutputLanguage::En) {
                continue;
            }
            let (fixed, _) = NotationRule::fix_all(&sources[index], &candidate);
            if NotationRule::first_violation(&sources[index], &fixed).is_none() {
                settled[index] = fixed;
            }
        }
    }

    /// Japanese text that came back unchanged (or still mostly Japanese) from an EN request.
    fn looks_untranslated(&self, source: &str, translated: &str, language: OutputLanguage) -> bool {
        if language != OutputLanguage::En {
            return false;
        }
        let (source, translated) = (source.trim(), translated.trim());
        if source.is_empty() || translated.is_empty() {
            return false;
        }
        if contains_hangul(translated) {
            return true;
        }
        if !self.detector.is_japanese(source) {
            return false;
        }
        source == translated
            || self
                .detector
                .is_japanese_with_threshold(translated, UNTRANSLATED_JAPANESE_RATIO)
    }

    async fn retry_untranslated(
        &self,
        blocks: &[TextBlock],
        options: RunOptions<'_>,
        max_chars: usize,
        result: &mut BatchTranslationResult,
    ) {
        let retry_blocks: Vec<TextBlock> = blocks
            .iter()
            .filter(|block| result.untranslated_block_ids.contains(&block.id))
            .cloned()
            .collect();
        let limit = max_chars
            .min(UNTRANSLATED_RETRY_MAX_CHARS)
            .max(MIN_SPLIT_CHARS);
        info!(
            "retrying {} untranslated block(s) (max_chars={})",
            retry_blocks.len(),
            limit
        );
        match self.run(&retry_blocks, options, limit, 1).await {
            Ok(sub) => {
                let cancelled = sub.cancelled;
                absorb(result, sub, false);
                result.cancelled |= cancelled;
            }
            Err(err) if is_cancelled(&err) => result.cancelled = true,
            Err(err) => warn!("untranslated retry failed: {:#}", err),
        }
    }
}

/// Merges a nested run. With `append` the nested blocks were not seen yet; otherwise
/// the nested run replaces earlier fallbacks.
fn absorb(result: &mut BatchTranslationResult, sub: BatchTranslationResult, append: bool) {
    result.mismatched_batch_count += sub.mismatched_batch_count;
    push_unique(&mut result.warnings, sub.warnings);
    if append {
        result.translations.extend(sub.translations);
        result
            .untranslated_block_ids
            .extend(sub.untranslated_block_ids);
        return;
    }
    for (id, text) in sub.translations {
        if !sub.untranslated_block_ids.contains(&id) {
            result.translations.insert(id.clone(), text);
            result.untranslated_block_ids.retain(|pending| *pending != id);
        }
    }
}

fn push_unique(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

impl std::fmt::Debug for BatchTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTranslator")
            .field("backend", &self.backend.kind())
            .field("limits", &self.limits)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
