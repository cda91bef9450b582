use anyhow::{Context, Result, anyhow};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, wait_with_backoff,
};
use super::transport::{ChatTransport, ReqwestTransport};
use super::{
    BackendClient, BackendFuture, BackendKind, CancelCallback, CancelSlot, ChunkCallback,
    cancellable, extract_error_message, parse_chat_completion,
};
use crate::clock::{SharedClock, system_clock};
use crate::error::BatchParseError;
use crate::parsers::{clean_batch_translation, parse_batch_translations, parse_plain_translation};

pub const DEFAULT_TOKEN_ENV: &str = "COPILOT_TOKEN";

#[derive(Debug, Clone, PartialEq)]
pub struct CopilotConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    /// Token that takes precedence over `token_env`.
    pub token: Option<String>,
    pub request_timeout: Duration,
    /// Pause between consecutive requests unless the caller skips it.
    pub min_interval: Duration,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.githubcopilot.com".to_string(),
            model: "gpt-4o".to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            token: None,
            request_timeout: Duration::from_secs(600),
            min_interval: Duration::from_secs(1),
        }
    }
}

/// Copilot chat over HTTP. Not safe for concurrent use; callers serialise requests.
pub struct CopilotClient {
    config: CopilotConfig,
    transport: Arc<dyn ChatTransport>,
    cancel: CancelSlot,
    clock: SharedClock,
    last_request: Mutex<Option<Instant>>,
}

impl CopilotClient {
    pub fn new(config: CopilotConfig) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::new()), system_clock())
    }

    pub fn with_transport(
        config: CopilotConfig,
        transport: Arc<dyn ChatTransport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            transport,
            cancel: CancelSlot::default(),
            clock,
            last_request: Mutex::new(None),
        }
    }

    fn token(&self) -> Result<String> {
        if let Some(token) = self.config.token.as_ref().filter(|token| !token.trim().is_empty()) {
            return Ok(token.clone());
        }
        std::env::var(&self.config.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "Copilot token not found: set the {} environment variable",
                    self.config.token_env
                )
            })
    }

    async fn cool_down(&self, skip: bool) {
        if skip || self.config.min_interval.is_zero() {
            return;
        }
        let last = *self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(last) = last else {
            return;
        };
        let elapsed = self.clock.now().saturating_duration_since(last);
        if let Some(remaining) = self.config.min_interval.checked_sub(elapsed)
            && !remaining.is_zero()
        {
            debug!("waiting {:.1}s before the next Copilot request", remaining.as_secs_f32());
            tokio::time::sleep(remaining).await;
        }
    }

    fn mark_request(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(self.clock.now());
    }

    async fn chat(&self, prompt: &str, skip_clear_wait: bool, timeout: Duration) -> Result<String> {
        self.cancel.check()?;
        self.cool_down(skip_clear_wait).await;
        let token = self.token()?;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0,
            "stream": false,
        });

        let mut attempt = 0usize;
        let mut delay = RATE_LIMIT_BASE_DELAY;
        loop {
            attempt += 1;
            self.cancel.check()?;
            let reply = cancellable(
                self.transport.post_json(&url, &body, Some(&token), timeout),
                self.cancel.get(),
            )
            .await
            .with_context(|| format!("failed to reach Copilot at {url}"))?;
            self.mark_request();
            if reply.is_success() {
                let (model, content) = parse_chat_completion(&reply.body)?;
                if let Some(model) = model {
                    debug!("Copilot model: {}", model);
                }
                return Ok(content);
            }
            if is_rate_limited(reply.status, &reply.body) && attempt < RATE_LIMIT_MAX_RETRIES {
                delay = wait_with_backoff("Copilot", attempt, delay, reply.retry_after).await;
                continue;
            }
            return Err(anyhow!(
                "Copilot API error ({}): {}",
                reply.status,
                extract_error_message(&reply.body)
            ));
        }
    }
}

impl BackendClient for CopilotClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Copilot
    }

    fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        self.cancel.set(callback);
    }

    fn translate_single<'a>(
        &'a self,
        _text: &'a str,
        prompt: &'a str,
        reference_files: &'a [PathBuf],
        on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            if !reference_files.is_empty() {
                debug!(
                    "{} reference file(s) are embedded in the Copilot prompt",
                    reference_files.len()
                );
            }
            let content = self.chat(prompt, false, self.config.request_timeout).await?;
            if let Some(on_chunk) = on_chunk {
                on_chunk(&content);
            }
            Ok(content)
        })
    }

    fn translate_sync<'a>(
        &'a self,
        texts: &'a [String],
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        skip_clear_wait: bool,
        timeout: Option<Duration>,
        include_item_ids: bool,
    ) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let timeout = timeout.unwrap_or(self.config.request_timeout);
            let raw = self.chat(prompt, skip_clear_wait, timeout).await?;
            let parsed = match parse_batch_translations(&raw, texts.len()) {
                Ok(parsed) => parsed,
                Err(BatchParseError::Unrecognized) if texts.len() == 1 => {
                    vec![parse_plain_translation(&raw).unwrap_or_default()]
                }
                Err(err) => return Err(err.into()),
            };
            debug!(
                "Copilot batch parsed (items={} id_markers={})",
                parsed.len(),
                include_item_ids
            );
            Ok(parsed
                .iter()
                .map(|translation| clean_batch_translation(translation))
                .collect::<Vec<_>>())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::transport::fake::{FakeTransport, Scripted};
    use crate::clock::ManualClock;

    fn client(config: CopilotConfig, replies: Vec<Scripted>) -> (CopilotClient, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(replies));
        let client = CopilotClient::with_transport(
            config,
            transport.clone(),
            Arc::new(ManualClock::new()),
        );
        (client, transport)
    }

    fn config() -> CopilotConfig {
        CopilotConfig {
            token: Some("test-token".to_string()),
            min_interval: Duration::ZERO,
            ..CopilotConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requests_back_off_and_retry() {
        let (client, transport) = client(
            config(),
            vec![Scripted::error(429, "Too Many Requests"), Scripted::ok_content("Net sales")],
        );
        let content = client.translate_single("売上高", "prompt", &[], None).await.unwrap();
        assert_eq!(content, "Net sales");
        assert_eq!(transport.bodies().len(), 2);
        assert_eq!(
            transport.bearers(),
            vec![Some("test-token".to_string()), Some("test-token".to_string())]
        );
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let (client, transport) = client(
            config(),
            vec![Scripted::error(401, r#"{"error":{"message":"bad credentials"}}"#)],
        );
        let err = client.translate_single("x", "prompt", &[], None).await.unwrap_err();
        assert_eq!(err.to_string(), "Copilot API error (401): bad credentials");
        assert_eq!(transport.bodies().len(), 1);
    }

    #[tokio::test]
    async fn missing_token_names_the_variable() {
        let config = CopilotConfig {
            token: None,
            token_env: "YAKULINGO_TEST_UNSET_COPILOT_TOKEN".to_string(),
            ..config()
        };
        let (client, transport) = client(config, vec![Scripted::ok_content("x")]);
        let err = client.translate_single("x", "prompt", &[], None).await.unwrap_err();
        assert!(err.to_string().contains("YAKULINGO_TEST_UNSET_COPILOT_TOKEN"));
        assert!(transport.bodies().is_empty());
    }

    #[tokio::test]
    async fn single_reply_is_delivered_as_one_chunk() {
        let (client, _) = client(config(), vec![Scripted::ok_content("Hello")]);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let on_chunk: ChunkCallback = Arc::new(move |text: &str| {
            sink.lock().unwrap().push(text.to_string());
        });
        client
            .translate_single("こんにちは", "prompt", &[], Some(on_chunk))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn numbered_batch_replies_are_parsed() {
        let (client, _) = client(
            config(),
            vec![Scripted::ok_content("1. Net sales\n2. Operating profit")],
        );
        let texts = vec!["売上高".to_string(), "営業利益".to_string()];
        let translations = client
            .translate_sync(&texts, "prompt", &[], false, None, true)
            .await
            .unwrap();
        assert_eq!(translations, vec!["Net sales", "Operating profit"]);
    }

    #[tokio::test]
    async fn single_item_batch_accepts_plain_text() {
        let (client, _) = client(config(), vec![Scripted::ok_content("Net sales")]);
        let texts = vec!["売上高".to_string()];
        let translations = client
            .translate_sync(&texts, "prompt", &[], false, None, false)
            .await
            .unwrap();
        assert_eq!(translations, vec!["Net sales"]);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_requests_wait_unless_skipped() {
        let config = CopilotConfig {
            min_interval: Duration::from_secs(2),
            ..config()
        };
        let (client, _) = client(
            config,
            vec![
                Scripted::ok_content("1. a"),
                Scripted::ok_content("1. b"),
                Scripted::ok_content("1. c"),
            ],
        );
        let texts = vec!["x".to_string()];
        let start = tokio::time::Instant::now();
        client.translate_sync(&texts, "p", &[], false, None, false).await.unwrap();
        client.translate_sync(&texts, "p", &[], true, None, false).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        client.translate_sync(&texts, "p", &[], false, None, false).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
