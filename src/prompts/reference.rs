use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::debug;

use super::glossary::{self, GlossaryEntry, GLOSSARY_MAX_LINES};

const MAX_FILE_CHARS: usize = 2000;
const MAX_TOTAL_CHARS: usize = 4000;
const FINGERPRINT_FULL_CHARS: usize = 128;
const FINGERPRINT_EDGE_CHARS: usize = 64;
const TEXT_EXTENSIONS: [&str; 4] = ["csv", "txt", "md", "json"];
const DOCUMENT_EXTENSIONS: [&str; 4] = ["pdf", "docx", "xlsx", "pptx"];
const GLOSSARY_FILE_NAMES: [&str; 2] = ["glossary.csv", "glossary_old.csv"];
const HEADER: &str =
    "### Reference (embedded)\nPrefer the following references when translating (they may be abridged).\n";

/// Reference text ready for a prompt, plus anything the user should be told about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedReference {
    pub text: String,
    pub warnings: Vec<String>,
    pub truncated: bool,
}

/// Identity of a file on disk: path, modification time and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FileKey {
    path: PathBuf,
    modified: Option<SystemTime>,
    size: u64,
}

impl FileKey {
    pub(crate) fn of(path: &Path) -> Self {
        let metadata = fs::metadata(path).ok();
        Self {
            path: path.to_path_buf(),
            modified: metadata.as_ref().and_then(|meta| meta.modified().ok()),
            size: metadata.map(|meta| meta.len()).unwrap_or(0),
        }
    }

    pub(crate) fn embedded(name: &str, content: &str) -> Self {
        Self {
            path: PathBuf::from(format!("<bundled>/{name}")),
            modified: None,
            size: content.len() as u64,
        }
    }
}

/// The glossary shipped with the prompts, already loaded.
#[derive(Debug, Clone)]
pub(crate) struct BundledGlossary {
    pub key: FileKey,
    pub content: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fingerprint {
    Full(String),
    Edges { len: usize, head: String, tail: String },
}

impl Fingerprint {
    fn of(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let len = text.chars().count();
        if len <= FINGERPRINT_FULL_CHARS {
            return Some(Fingerprint::Full(text.to_string()));
        }
        Some(Fingerprint::Edges {
            len,
            head: text.chars().take(FINGERPRINT_EDGE_CHARS).collect(),
            tail: text.chars().skip(len - FINGERPRINT_EDGE_CHARS).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EmbedKey {
    files: Vec<FileKey>,
    input: Option<Fingerprint>,
    excluded: BTreeSet<String>,
}

enum Source<'a> {
    Bundled(&'a BundledGlossary),
    File(&'a Path),
}

impl Source<'_> {
    fn key(&self) -> FileKey {
        match self {
            Source::Bundled(bundled) => bundled.key.clone(),
            Source::File(path) => FileKey::of(path),
        }
    }

    fn display_name(&self) -> String {
        match self {
            Source::Bundled(_) => "glossary.csv".to_string(),
            Source::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// Builds the `### Reference (embedded)` block and memoises file reads.
#[derive(Debug, Default)]
pub struct ReferenceEmbedder {
    texts: Mutex<HashMap<FileKey, (String, bool)>>,
    glossaries: Mutex<HashMap<FileKey, Arc<Vec<GlossaryEntry>>>>,
    last: Mutex<Option<(EmbedKey, EmbeddedReference)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (text[..cut].to_string(), true),
        None => (text.to_string(), false),
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(
        String::from_utf8_lossy(&bytes)
            .trim_start_matches('\u{feff}')
            .to_string(),
    )
}

fn join_lines_with_limit(lines: &[String], max_chars: usize) -> (String, bool) {
    let mut kept: Vec<&str> = Vec::new();
    let mut total = 0usize;
    for line in lines.iter().filter(|line| !line.is_empty()) {
        let needed = line.chars().count() + usize::from(!kept.is_empty());
        if total + needed > max_chars {
            return (kept.join("\n"), true);
        }
        kept.push(line);
        total += needed;
    }
    (kept.join("\n"), false)
}

impl ReferenceEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        lock(&self.texts).clear();
        lock(&self.glossaries).clear();
        *lock(&self.last) = None;
    }

    pub(crate) fn embed(
        &self,
        bundled: Option<&BundledGlossary>,
        reference_files: &[PathBuf],
        input_text: &str,
        excluded_sources: &BTreeSet<String>,
    ) -> EmbeddedReference {
        let has_input = !input_text.trim().is_empty();
        let mut sources: Vec<Source<'_>> = Vec::new();
        if let Some(bundled) = bundled.filter(|_| has_input) {
            sources.push(Source::Bundled(bundled));
        }
        sources.extend(reference_files.iter().map(|path| Source::File(path.as_path())));
        if sources.is_empty() {
            return EmbeddedReference::default();
        }

        let keys: Vec<FileKey> = sources.iter().map(Source::key).collect();
        let embed_key = EmbedKey {
            files: keys.clone(),
            input: Fingerprint::of(input_text),
            excluded: excluded_sources.clone(),
        };
        if let Some((cached_key, cached)) = lock(&self.last).as_ref()
            && *cached_key == embed_key
        {
            debug!("reference embed cache hit");
            return cached.clone();
        }

        let embedded = self.render(&sources, &keys, input_text, excluded_sources);
        *lock(&self.last) = Some((embed_key, embedded.clone()));
        embedded
    }

    fn render(
        &self,
        sources: &[Source<'_>],
        keys: &[FileKey],
        input_text: &str,
        excluded_sources: &BTreeSet<String>,
    ) -> EmbeddedReference {
        let mut warnings = Vec::new();
        let mut truncated = false;
        let mut total = 0usize;
        let mut parts = Vec::new();

        for (source, key) in sources.iter().zip(keys) {
            let name = source.display_name();
            let extension = Path::new(&name)
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let is_glossary = matches!(source, Source::Bundled(_))
                || (extension == "csv"
                    && GLOSSARY_FILE_NAMES.contains(&name.to_lowercase().as_str()));

            let (content, was_truncated) = if is_glossary {
                if input_text.trim().is_empty() {
                    continue;
                }
                let Some(entries) = self.glossary_entries(source, key) else {
                    warnings.push(format!("could not read reference file: {name}"));
                    continue;
                };
                let (matched, glossary_truncated) =
                    glossary::select_entries(&entries, input_text, GLOSSARY_MAX_LINES, excluded_sources);
                let lines: Vec<String> = matched
                    .iter()
                    .filter(|(_, target)| !target.is_empty())
                    .map(|(source, target)| glossary::format_pair(source, target))
                    .collect();
                if lines.is_empty() {
                    continue;
                }
                let budget = MAX_FILE_CHARS.min(MAX_TOTAL_CHARS.saturating_sub(total));
                let (content, cut) = join_lines_with_limit(&lines, budget);
                if content.is_empty() {
                    continue;
                }
                (content, cut || glossary_truncated)
            } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
                let Source::File(path) = source else {
                    continue;
                };
                let Some((content, cut)) = self.text_content(path, key) else {
                    warnings.push(format!("could not read reference file: {name}"));
                    continue;
                };
                if content.is_empty() {
                    continue;
                }
                (content, cut)
            } else if DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
                warnings.push(format!(
                    "reference file format cannot be embedded as text, skipped: {name}"
                ));
                continue;
            } else {
                warnings.push(format!("unsupported reference file skipped: {name}"));
                continue;
            };

            let mut content = content;
            if was_truncated {
                truncated = true;
                if !is_glossary {
                    warnings.push(format!(
                        "reference file abridged (limit {MAX_FILE_CHARS} chars): {name}"
                    ));
                }
            }

            let remaining = MAX_TOTAL_CHARS.saturating_sub(total);
            if remaining == 0 {
                truncated = true;
                if !is_glossary {
                    warnings.push(format!(
                        "reference files abridged (total limit {MAX_TOTAL_CHARS} chars)"
                    ));
                }
                break;
            }
            let (kept, cut) = take_chars(&content, remaining);
            if cut {
                content = kept;
                truncated = true;
                if !is_glossary {
                    warnings.push(format!(
                        "reference files abridged (total limit {MAX_TOTAL_CHARS} chars)"
                    ));
                }
            }

            total += content.chars().count();
            parts.push(format!("[REFERENCE:file={name}]\n{content}\n[/REFERENCE]"));
        }

        if parts.is_empty() {
            return EmbeddedReference {
                text: String::new(),
                warnings,
                truncated,
            };
        }
        EmbeddedReference {
            text: format!("{HEADER}{}", parts.join("\n\n")),
            warnings,
            truncated,
        }
    }

    fn glossary_entries(&self, source: &Source<'_>, key: &FileKey) -> Option<Arc<Vec<GlossaryEntry>>> {
        if let Some(entries) = lock(&self.glossaries).get(key) {
            return Some(Arc::clone(entries));
        }
        let raw = match source {
            Source::Bundled(bundled) => bundled.content.to_string(),
            Source::File(path) => read_lossy(path)?,
        };
        let entries = Arc::new(glossary::parse_glossary_csv(&raw));
        lock(&self.glossaries).insert(key.clone(), Arc::clone(&entries));
        Some(entries)
    }

    fn text_content(&self, path: &Path, key: &FileKey) -> Option<(String, bool)> {
        if let Some(cached) = lock(&self.texts).get(key) {
            return Some(cached.clone());
        }
        let raw = read_lossy(path)?;
        let content = take_chars(raw.trim(), MAX_FILE_CHARS);
        lock(&self.texts).insert(key.clone(), content.clone());
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundled(content: &str) -> BundledGlossary {
        BundledGlossary {
            key: FileKey::embedded("glossary.csv", content),
            content: Arc::from(content),
        }
    }

    #[test]
    fn no_sources_means_no_reference() {
        let embedder = ReferenceEmbedder::new();
        let glossary = bundled("売上高,Net sales\n");
        let embedded = embedder.embed(Some(&glossary), &[], "  ", &BTreeSet::new());
        assert_eq!(embedded, EmbeddedReference::default());
    }

    #[test]
    fn bundled_glossary_embeds_matching_pairs() {
        let embedder = ReferenceEmbedder::new();
        let glossary = bundled("売上高,Net sales\n営業利益,Operating income\n");
        let embedded = embedder.embed(Some(&glossary), &[], "売上高が増加", &BTreeSet::new());
        assert_eq!(
            embedded.text,
            "### Reference (embedded)\nPrefer the following references when translating (they may be abridged).\n[REFERENCE:file=glossary.csv]\n- JP: 売上高 | EN: Net sales\n[/REFERENCE]"
        );
        assert!(embedded.warnings.is_empty());
        assert!(!embedded.truncated);
    }

    #[test]
    fn generated_sources_suppress_bundled_lines() {
        let embedder = ReferenceEmbedder::new();
        let glossary = bundled("22万円,220,000 yen\n売上高,Net sales\n");
        let excluded = BTreeSet::from(["22万円".to_string()]);
        let embedded = embedder.embed(Some(&glossary), &[], "売上高は22万円", &excluded);
        assert!(embedded.text.contains("Net sales"));
        assert!(!embedded.text.contains("220,000 yen"));
    }

    #[test]
    fn long_files_are_truncated_with_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("notes.txt");
        let second = dir.path().join("more.md");
        let third = dir.path().join("extra.json");
        fs::write(&first, "a".repeat(2500)).unwrap();
        fs::write(&second, "b".repeat(1999)).unwrap();
        fs::write(&third, "c".repeat(500)).unwrap();

        let embedder = ReferenceEmbedder::new();
        let embedded = embedder.embed(None, &[first, second, third], "text", &BTreeSet::new());
        assert!(embedded.truncated);
        assert_eq!(
            embedded.warnings,
            vec![
                "reference file abridged (limit 2000 chars): notes.txt".to_string(),
                "reference files abridged (total limit 4000 chars)".to_string(),
            ]
        );
        assert!(embedded.text.contains(&format!("[REFERENCE:file=notes.txt]\n{}\n[/REFERENCE]", "a".repeat(2000))));
        assert!(embedded.text.contains(&format!("[REFERENCE:file=more.md]\n{}\n[/REFERENCE]", "b".repeat(1999))));
        assert!(embedded.text.ends_with("[REFERENCE:file=extra.json]\nc\n[/REFERENCE]"));
    }

    #[test]
    fn unsupported_and_document_files_only_warn() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("logo.png");
        let pdf = dir.path().join("report.pdf");
        fs::write(&image, b"png").unwrap();
        fs::write(&pdf, b"%PDF").unwrap();

        let embedder = ReferenceEmbedder::new();
        let embedded = embedder.embed(None, &[image, pdf], "text", &BTreeSet::new());
        assert_eq!(embedded.text, "");
        assert_eq!(
            embedded.warnings,
            vec![
                "unsupported reference file skipped: logo.png".to_string(),
                "reference file format cannot be embedded as text, skipped: report.pdf".to_string(),
            ]
        );
    }

    #[test]
    fn changed_files_are_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terms.txt");
        fs::write(&path, "first").unwrap();

        let embedder = ReferenceEmbedder::new();
        let before = embedder.embed(None, &[path.clone()], "input", &BTreeSet::new());
        assert!(before.text.contains("first"));

        fs::write(&path, "second version").unwrap();
        let after = embedder.embed(None, &[path], "input", &BTreeSet::new());
        assert!(after.text.contains("second version"));
    }
}
