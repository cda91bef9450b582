//! File processors: how documents are cut into blocks and written back.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::TextBlock;

pub trait FileProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, path: &Path) -> bool;

    fn extract_text_blocks(&self, input: &Path) -> Result<Vec<TextBlock>>;

    /// Writes `input` to `output` with every block replaced by its translation.
    /// Blocks missing from `translations` keep their source text.
    fn apply_translations(
        &self,
        input: &Path,
        output: &Path,
        translations: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// `<stem>_translated.<ext>` next to `input`, then `_2`, `_3`, ... while taken.
pub fn output_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = input
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let parent = input.parent().unwrap_or_else(|| Path::new(""));
    let mut candidate = parent.join(format!("{stem}_translated{extension}"));
    let mut counter = 2;
    while candidate.exists() {
        candidate = parent.join(format!("{stem}_translated_{counter}{extension}"));
        counter += 1;
    }
    candidate
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Paragraph { body: String, ending: String, line: usize },
    Gap(String),
}

fn segments(content: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut paragraph = String::new();
    let mut start_line = 0usize;
    let mut gap = String::new();
    let flush = |paragraph: &mut String, line: usize, segments: &mut Vec<Segment>| {
        if paragraph.is_empty() {
            return;
        }
        let body = paragraph.trim_end_matches(['\r', '\n']).to_string();
        let ending = paragraph[body.len()..].to_string();
        segments.push(Segment::Paragraph { body, ending, line });
        paragraph.clear();
    };
    for (index, line) in content.split_inclusive('\n').enumerate() {
        if line.trim().is_empty() {
            flush(&mut paragraph, start_line, &mut segments);
            gap.push_str(line);
            continue;
        }
        if !gap.is_empty() {
            segments.push(Segment::Gap(std::mem::take(&mut gap)));
        }
        if paragraph.is_empty() {
            start_line = index + 1;
        }
        paragraph.push_str(line);
    }
    flush(&mut paragraph, start_line, &mut segments);
    if !gap.is_empty() {
        segments.push(Segment::Gap(gap));
    }
    segments
}

/// `.txt` / `.md` files; one block per blank-line separated paragraph.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextProcessor;

impl PlainTextProcessor {
    fn read(path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

impl FileProcessor for PlainTextProcessor {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "txt" | "md"))
            .unwrap_or(false)
    }

    fn extract_text_blocks(&self, input: &Path) -> Result<Vec<TextBlock>> {
        let content = Self::read(input)?;
        let mut blocks = Vec::new();
        for segment in segments(&content) {
            if let Segment::Paragraph { body, line, .. } = segment {
                let id = format!("p{}", blocks.len() + 1);
                blocks.push(TextBlock::new(id, body, format!("line {line}")));
            }
        }
        Ok(blocks)
    }

    fn apply_translations(
        &self,
        input: &Path,
        output: &Path,
        translations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let content = Self::read(input)?;
        let mut rendered = String::with_capacity(content.len());
        let mut index = 0usize;
        for segment in segments(&content) {
            match segment {
                Segment::Paragraph { body, ending, .. } => {
                    index += 1;
                    let text = translations
                        .get(&format!("p{index}"))
                        .map(String::as_str)
                        .unwrap_or(body.as_str());
                    rendered.push_str(text);
                    rendered.push_str(&ending);
                }
                Segment::Gap(gap) => rendered.push_str(&gap),
            }
        }
        fs::write(output, rendered)
            .with_context(|| format!("failed to write {}", output.display()))
    }
}
