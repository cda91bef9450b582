//! Prompt rendering: bundled Tera templates, translation rules, numeric hints,
//! generated glossary pairs and embedded reference files.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use tera::{Context as TeraContext, Tera};
use tracing::debug;

use crate::models::{OutputLanguage, TranslationStyle};
use crate::notation::{self, DEFAULT_MAX_GLOSSARY_PAIRS};

pub mod glossary;
pub mod reference;

pub use reference::{EmbeddedReference, ReferenceEmbedder};

use reference::{BundledGlossary, FileKey};

include!(concat!(env!("OUT_DIR"), "/embedded_prompt_files.rs"));

const RULES_FILE: &str = "translation_rules.txt";
const GLOSSARY_FILE: &str = "glossary.csv";
const BATCH_CONTEXT_MAX_CHARS: usize = 3000;
const ATTACHED_REFERENCE_NOTE: &str = "### Reference files\nReference files (glossaries, source material) are attached. Use their terminology; glossary terms must be translated exactly as listed.";

/// Final prompt text plus what happened while embedding references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub text: String,
    pub reference_warnings: Vec<String>,
    pub reference_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RuleSection {
    Common,
    ToEn,
    ToJp,
}

/// Splits a rules file into its `[COMMON]`, `[TO_EN]` and `[TO_JP]` parts and joins
/// the ones that apply to `output_language`.
pub fn select_translation_rules(raw: &str, output_language: OutputLanguage) -> String {
    let mut current = RuleSection::Common;
    let mut sections: HashMap<RuleSection, Vec<&str>> = HashMap::new();
    for line in raw.lines() {
        let tag = match line.trim() {
            "[COMMON]" => Some(RuleSection::Common),
            "[TO_EN]" => Some(RuleSection::ToEn),
            "[TO_JP]" => Some(RuleSection::ToJp),
            _ => None,
        };
        match tag {
            Some(section) => current = section,
            None => sections.entry(current).or_default().push(line),
        }
    }
    let directional = match output_language {
        OutputLanguage::En => RuleSection::ToEn,
        OutputLanguage::Jp => RuleSection::ToJp,
    };
    [RuleSection::Common, directional]
        .into_iter()
        .filter_map(|section| sections.get(&section))
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn style_guidance(style: TranslationStyle) -> &'static str {
    match style {
        TranslationStyle::Standard => {
            "natural, complete business English that keeps every nuance of the source."
        }
        TranslationStyle::Concise => {
            "compact business English; drop redundant words but keep all facts and numbers."
        }
        TranslationStyle::Minimal => {
            "headline-style English for slides and tables; shortest wording that keeps the facts, abbreviations welcome."
        }
    }
}

#[derive(Debug, Serialize)]
struct StyleEntry {
    style: &'static str,
    guidance: &'static str,
}

/// Ends a non-empty prompt section with one blank line.
fn section(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        String::new()
    } else {
        format!("{text}\n\n")
    }
}

fn extra_line(extra_instruction: Option<&str>) -> String {
    match extra_instruction.map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{extra}\n"),
        _ => String::new(),
    }
}

fn batch_context(texts: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0usize;
    for text in texts.iter().filter(|text| !text.is_empty()) {
        if total >= BATCH_CONTEXT_MAX_CHARS {
            break;
        }
        let remaining = BATCH_CONTEXT_MAX_CHARS - total;
        let len = text.chars().count();
        if len > remaining {
            parts.push(text.chars().take(remaining).collect());
            break;
        }
        parts.push(text.clone());
        total += len + 1;
    }
    parts.join("\n")
}

#[derive(Debug, Clone)]
struct CachedFile {
    key: FileKey,
    content: Arc<str>,
}

/// Builds every prompt the service sends to a backend.
///
/// Files come from the bundled set unless a directory override holds a file with
/// the same name; overridden files are re-read when their mtime or size changes.
#[derive(Debug, Default)]
pub struct PromptBuilder {
    directory: Option<PathBuf>,
    use_bundled_glossary: bool,
    files: Mutex<HashMap<String, CachedFile>>,
    reference: ReferenceEmbedder,
}

impl PromptBuilder {
    pub fn new(directory: Option<PathBuf>, use_bundled_glossary: bool) -> Self {
        Self {
            directory,
            use_bundled_glossary,
            files: Mutex::new(HashMap::new()),
            reference: ReferenceEmbedder::new(),
        }
    }

    pub fn clear_cache(&self) {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.reference.clear();
    }

    fn override_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.directory.as_ref()?.join(name);
        path.is_file().then_some(path)
    }

    fn load_file(&self, name: &str) -> Result<Arc<str>> {
        let Some(path) = self.override_path(name) else {
            return embedded_prompt_file(name)
                .map(Arc::from)
                .ok_or_else(|| anyhow!("missing prompt file: {name}"));
        };
        let key = FileKey::of(&path);
        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = files.get(name)
            && cached.key == key
        {
            return Ok(Arc::clone(&cached.content));
        }
        debug!("loading prompt file {}", path.display());
        let content: Arc<str> = fs::read_to_string(&path)
            .with_context(|| format!("failed to read prompt: {}", path.display()))?
            .into();
        files.insert(
            name.to_string(),
            CachedFile {
                key,
                content: Arc::clone(&content),
            },
        );
        Ok(content)
    }

    fn bundled_glossary(&self) -> Option<BundledGlossary> {
        if !self.use_bundled_glossary {
            return None;
        }
        if let Some(path) = self.override_path(GLOSSARY_FILE) {
            let content = self.load_file(GLOSSARY_FILE).ok()?;
            return Some(BundledGlossary {
                key: FileKey::of(&path),
                content,
            });
        }
        let content = embedded_prompt_file(GLOSSARY_FILE)?;
        Some(BundledGlossary {
            key: FileKey::embedded(GLOSSARY_FILE, content),
            content: Arc::from(content),
        })
    }

    pub fn translation_rules(&self, output_language: OutputLanguage) -> Result<String> {
        let raw = self.load_file(RULES_FILE)?;
        Ok(select_translation_rules(&raw, output_language))
    }

    fn rules_for_text(&self, output_language: OutputLanguage, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        self.translation_rules(output_language)
    }

    fn embed_references(
        &self,
        reference_files: &[PathBuf],
        input_text: &str,
        generated: &[(String, String)],
    ) -> EmbeddedReference {
        let excluded: BTreeSet<String> = generated.iter().map(|(source, _)| source.clone()).collect();
        let bundled = self.bundled_glossary();
        self.reference
            .embed(bundled.as_ref(), reference_files, input_text, &excluded)
    }

    fn render(&self, template_name: &str, context: &TeraContext) -> Result<String> {
        let template = self.load_file(template_name)?;
        Tera::one_off(&template, context, false)
            .with_context(|| format!("failed to render prompt template {template_name}"))
    }

    fn finish(text: String, reference: EmbeddedReference) -> BuiltPrompt {
        BuiltPrompt {
            text,
            reference_warnings: reference.warnings,
            reference_truncated: reference.truncated,
        }
    }

    /// Batch prompt asking for `{"items":[{"id":n,"translation":...}]}`.
    ///
    /// With `include_item_ids` every item is prefixed with `[[ID:n]]` so that the
    /// reply can still be matched up when the JSON structure is lost.
    pub fn build_batch(
        &self,
        texts: &[String],
        has_reference_files: bool,
        output_language: OutputLanguage,
        style: TranslationStyle,
        include_item_ids: bool,
        reference_files: &[PathBuf],
    ) -> Result<BuiltPrompt> {
        let context_text = batch_context(texts);
        let generated = match output_language {
            OutputLanguage::En => {
                notation::to_en_glossary_pairs(&context_text, DEFAULT_MAX_GLOSSARY_PAIRS)
            }
            OutputLanguage::Jp => Vec::new(),
        };
        let reference = self.embed_references(reference_files, &context_text, &generated);
        let mut reference_section = section(&reference.text);
        if has_reference_files && reference_files.is_empty() {
            reference_section.push_str(&section(ATTACHED_REFERENCE_NOTE));
        }

        let items: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let id = index + 1;
                let text = if include_item_ids {
                    format!("[[ID:{id}]] {text}")
                } else {
                    text.clone()
                };
                json!({"id": id, "text": text})
            })
            .collect();
        let items_json = serde_json::to_string(&json!({ "items": items }))?;

        let mut context = TeraContext::new();
        context.insert("translation_rules", &self.translation_rules(output_language)?);
        context.insert("glossary_section", &section(&glossary::generated_section(&generated)));
        context.insert("reference_section", &reference_section);
        context.insert("style", style.as_str());
        context.insert("style_guidance", style_guidance(style));
        context.insert("include_item_ids", &include_item_ids);
        context.insert("items_json", &items_json);
        context.insert("n_items", &texts.len());
        context.insert("output_language", output_language.as_str());

        let template = match output_language {
            OutputLanguage::En => "batch_to_en.tera",
            OutputLanguage::Jp => "batch_to_jp.tera",
        };
        Ok(Self::finish(self.render(template, &context)?, reference))
    }

    fn to_en_context(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        detected_language: &str,
        extra_instruction: Option<&str>,
    ) -> Result<(TeraContext, EmbeddedReference)> {
        let generated = notation::to_en_glossary_pairs(text, DEFAULT_MAX_GLOSSARY_PAIRS);
        let reference = self.embed_references(reference_files, text, &generated);
        let mut context = TeraContext::new();
        context.insert("translation_rules", &self.rules_for_text(OutputLanguage::En, text)?);
        context.insert("numeric_hints", &section(&notation::numeric_hints(text)));
        context.insert("glossary_section", &section(&glossary::generated_section(&generated)));
        context.insert("reference_section", &section(&reference.text));
        context.insert("extra_instruction", &extra_line(extra_instruction));
        context.insert("input_text", text.trim());
        context.insert("detected_language", detected_language);
        Ok((context, reference))
    }

    pub fn build_text_to_en_single(
        &self,
        text: &str,
        style: TranslationStyle,
        reference_files: &[PathBuf],
        detected_language: &str,
        extra_instruction: Option<&str>,
    ) -> Result<BuiltPrompt> {
        let (mut context, reference) =
            self.to_en_context(text, reference_files, detected_language, extra_instruction)?;
        context.insert("style", style.as_str());
        context.insert("style_guidance", style_guidance(style));
        Ok(Self::finish(
            self.render("text_to_en_single.tera", &context)?,
            reference,
        ))
    }

    pub fn build_text_to_en_3style(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        detected_language: &str,
        extra_instruction: Option<&str>,
    ) -> Result<BuiltPrompt> {
        let (mut context, reference) =
            self.to_en_context(text, reference_files, detected_language, extra_instruction)?;
        context.insert("standard_guidance", style_guidance(TranslationStyle::Standard));
        context.insert("concise_guidance", style_guidance(TranslationStyle::Concise));
        context.insert("minimal_guidance", style_guidance(TranslationStyle::Minimal));
        Ok(Self::finish(
            self.render("text_to_en_3style.tera", &context)?,
            reference,
        ))
    }

    /// Follow-up prompt for the styles a 3-style reply left out.
    pub fn build_text_to_en_missing_styles(
        &self,
        text: &str,
        styles: &[TranslationStyle],
        reference_files: &[PathBuf],
        detected_language: &str,
        extra_instruction: Option<&str>,
    ) -> Result<BuiltPrompt> {
        let mut unique: Vec<TranslationStyle> = Vec::new();
        for style in styles {
            if !unique.contains(style) {
                unique.push(*style);
            }
        }
        let names: Vec<&str> = unique.iter().map(TranslationStyle::as_str).collect();
        let entries: Vec<StyleEntry> = unique
            .iter()
            .map(|style| StyleEntry {
                style: style.as_str(),
                guidance: style_guidance(*style),
            })
            .collect();

        let (mut context, reference) =
            self.to_en_context(text, reference_files, detected_language, extra_instruction)?;
        context.insert("styles_json", &serde_json::to_string(&names)?);
        context.insert("n_styles", &unique.len());
        context.insert("style_entries", &entries);
        Ok(Self::finish(
            self.render("text_to_en_missing_styles.tera", &context)?,
            reference,
        ))
    }

    pub fn build_text_to_jp(
        &self,
        text: &str,
        reference_files: &[PathBuf],
        detected_language: &str,
    ) -> Result<BuiltPrompt> {
        let reference = self.embed_references(reference_files, text, &[]);
        let mut context = TeraContext::new();
        context.insert("translation_rules", &self.rules_for_text(OutputLanguage::Jp, text)?);
        context.insert("reference_section", &section(&reference.text));
        context.insert("input_text", text.trim());
        context.insert("detected_language", detected_language);
        Ok(Self::finish(self.render("text_to_jp.tera", &context)?, reference))
    }
}
