use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendKind, CopilotConfig, LocalConfig};
use crate::models::TranslationStyle;
use crate::service::{BatchLimits, ServiceOptions};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend: BackendKind,
    pub request_timeout: Duration,
    pub local: LocalConfig,
    pub copilot: CopilotConfig,
    pub file_limits: BatchLimits,
    pub text_limits: BatchLimits,
    pub prompts_directory: Option<PathBuf>,
    pub use_bundled_glossary: bool,
    pub default_style: TranslationStyle,
}

impl Default for Settings {
    fn default() -> Self {
        let service = ServiceOptions::default();
        Self {
            backend: BackendKind::Local,
            request_timeout: service.request_timeout,
            local: LocalConfig::default(),
            copilot: CopilotConfig::default(),
            file_limits: service.file_limits,
            text_limits: service.text_limits,
            prompts_directory: None,
            use_bundled_glossary: true,
            default_style: service.default_style,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    backend: Option<BackendSettings>,
    local: Option<LocalSettings>,
    copilot: Option<CopilotSettings>,
    batch: Option<BatchSettings>,
    prompts: Option<PromptSettings>,
    text: Option<TextSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendSettings {
    kind: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LocalSettings {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    top_p: Option<f64>,
    top_k: Option<u32>,
    min_p: Option<f64>,
    repeat_penalty: Option<f64>,
    stop: Option<Vec<String>>,
    stream: Option<bool>,
    prompt_repeat_retry: Option<bool>,
    capability_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CopilotSettings {
    base_url: Option<String>,
    model: Option<String>,
    token_env: Option<String>,
    min_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchSettings {
    max_chars_per_batch: Option<usize>,
    max_items_per_batch: Option<usize>,
    text_max_chars_per_batch: Option<usize>,
    text_max_items_per_batch: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptSettings {
    directory: Option<String>,
    use_bundled_glossary: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TextSettings {
    default_style: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.merge_str(DEFAULT_SETTINGS_TOML, Path::new("<bundled settings.toml>"))?;
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings.merge_str(&content, &path)?;
        }
    }
    settings.sync_timeouts();
    Ok(settings)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

impl Settings {
    fn merge_str(&mut self, content: &str, origin: &Path) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)
            .with_context(|| format!("failed to parse settings: {}", origin.display()))?;
        self.merge(parsed)
            .with_context(|| format!("invalid settings: {}", origin.display()))
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(backend) = incoming.backend {
            if let Some(kind) = non_empty(backend.kind) {
                self.backend = BackendKind::parse(&kind)
                    .ok_or_else(|| anyhow!("unknown backend kind '{}'", kind))?;
            }
            if let Some(secs) = backend.request_timeout_secs
                && secs > 0
            {
                self.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(local) = incoming.local {
            let config = &mut self.local;
            if let Some(url) = non_empty(local.base_url) {
                config.base_url = url;
            }
            if let Some(model) = non_empty(local.model) {
                config.model = model;
            }
            if let Some(temperature) = local.temperature {
                config.temperature = temperature;
            }
            config.max_tokens = local.max_tokens.or(config.max_tokens);
            config.top_p = local.top_p.or(config.top_p);
            config.top_k = local.top_k.or(config.top_k);
            config.min_p = local.min_p.or(config.min_p);
            config.repeat_penalty = local.repeat_penalty.or(config.repeat_penalty);
            if let Some(stop) = local.stop {
                config.stop = stop;
            }
            if let Some(stream) = local.stream {
                config.stream = stream;
            }
            if let Some(repeat) = local.prompt_repeat_retry {
                config.prompt_repeat_retry = repeat;
            }
            if let Some(secs) = local.capability_ttl_secs {
                config.capability_ttl = Duration::from_secs(secs);
            }
        }
        if let Some(copilot) = incoming.copilot {
            let config = &mut self.copilot;
            if let Some(url) = non_empty(copilot.base_url) {
                config.base_url = url;
            }
            if let Some(model) = non_empty(copilot.model) {
                config.model = model;
            }
            if let Some(env) = non_empty(copilot.token_env) {
                config.token_env = env;
            }
            if let Some(ms) = copilot.min_interval_ms {
                config.min_interval = Duration::from_millis(ms);
            }
        }
        if let Some(batch) = incoming.batch {
            merge_limit(&mut self.file_limits.max_chars_per_batch, batch.max_chars_per_batch);
            merge_limit(&mut self.file_limits.max_items_per_batch, batch.max_items_per_batch);
            merge_limit(
                &mut self.text_limits.max_chars_per_batch,
                batch.text_max_chars_per_batch,
            );
            merge_limit(
                &mut self.text_limits.max_items_per_batch,
                batch.text_max_items_per_batch,
            );
        }
        if let Some(prompts) = incoming.prompts {
            if let Some(directory) = non_empty(prompts.directory) {
                self.prompts_directory = Some(PathBuf::from(directory));
            }
            if let Some(bundled) = prompts.use_bundled_glossary {
                self.use_bundled_glossary = bundled;
            }
        }
        if let Some(text) = incoming.text
            && let Some(style) = non_empty(text.default_style)
        {
            self.default_style = TranslationStyle::parse(&style)
                .ok_or_else(|| anyhow!("unknown translation style '{}'", style))?;
        }
        Ok(())
    }

    fn sync_timeouts(&mut self) {
        self.local.request_timeout = self.request_timeout;
        self.copilot.request_timeout = self.request_timeout;
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            file_limits: self.file_limits,
            text_limits: self.text_limits,
            request_timeout: self.request_timeout,
            default_style: self.default_style,
        }
    }
}

fn merge_limit(target: &mut usize, value: Option<usize>) {
    if let Some(value) = value
        && value > 0
    {
        *target = value;
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".yakulingo"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn bundled_defaults_are_written_to_home() {
        with_temp_home(|home| {
            let settings = load_settings(None).unwrap();
            assert_eq!(settings.backend, BackendKind::Local);
            assert_eq!(settings.file_limits.max_chars_per_batch, 1000);
            assert_eq!(settings.file_limits.max_items_per_batch, 40);
            assert_eq!(settings.text_limits.max_chars_per_batch, 800);
            assert_eq!(settings.default_style, TranslationStyle::Concise);
            assert_eq!(settings.copilot.token_env, "COPILOT_TOKEN");
            assert!(settings.local.prompt_repeat_retry);
            assert!(home.join(".yakulingo").join("settings.toml").exists());
        });
    }

    #[test]
    fn home_local_settings_override_defaults() {
        with_temp_home(|home| {
            let dir = home.join(".yakulingo");
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("settings.local.toml"),
                "[backend]\nkind = \"copilot\"\nrequest_timeout_secs = 30\n\n[copilot]\nmin_interval_ms = 0\n\n[local]\nprompt_repeat_retry = false\ntop_k = 20\n",
            )
            .unwrap();

            let settings = load_settings(None).unwrap();
            assert_eq!(settings.backend, BackendKind::Copilot);
            assert_eq!(settings.copilot.min_interval, Duration::ZERO);
            assert_eq!(settings.copilot.request_timeout, Duration::from_secs(30));
            assert_eq!(settings.local.request_timeout, Duration::from_secs(30));
            assert!(!settings.local.prompt_repeat_retry);
            assert_eq!(settings.local.top_k, Some(20));
        });
    }

    #[test]
    fn explicit_settings_path_wins_and_must_exist() {
        with_temp_home(|home| {
            let extra = home.join("custom.toml");
            fs::write(
                &extra,
                "[batch]\nmax_chars_per_batch = 500\ntext_max_items_per_batch = 5\n\n[text]\ndefault_style = \"minimal\"\n",
            )
            .unwrap();
            let settings = load_settings(Some(&extra)).unwrap();
            assert_eq!(settings.file_limits.max_chars_per_batch, 500);
            assert_eq!(settings.text_limits.max_items_per_batch, 5);
            assert_eq!(settings.default_style, TranslationStyle::Minimal);
            assert_eq!(settings.service_options().file_limits.max_chars_per_batch, 500);

            let missing = home.join("missing.toml");
            assert!(load_settings(Some(&missing)).is_err());
        });
    }

    #[test]
    fn unknown_backend_is_rejected() {
        with_temp_home(|home| {
            let extra = home.join("bad.toml");
            fs::write(&extra, "[backend]\nkind = \"cloud\"\n").unwrap();
            let err = load_settings(Some(&extra)).unwrap_err();
            assert!(format!("{err:#}").contains("unknown backend kind 'cloud'"));
        });
    }
}
