use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TranslationCancelled;

pub mod capability;
mod copilot;
mod local;
pub(crate) mod retry;
pub mod stream;
pub mod transport;

pub use copilot::{CopilotClient, CopilotConfig};
pub use local::{LocalClient, LocalConfig};
pub use transport::{ChatTransport, ReqwestTransport};

/// Returns true once the caller wants the in-flight request abandoned.
pub type CancelCallback = Arc<dyn Fn() -> bool + Send + Sync>;
/// Receives streamed text as it arrives.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Copilot,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Copilot => "copilot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" | "local_ai" | "llama" => Some(BackendKind::Local),
            "copilot" => Some(BackendKind::Copilot),
            _ => None,
        }
    }

    /// Whether calls must be serialised by the caller.
    pub fn is_concurrency_safe(&self) -> bool {
        matches!(self, BackendKind::Local)
    }
}

pub trait BackendClient: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn set_cancel_callback(&self, callback: Option<CancelCallback>);

    fn translate_single<'a>(
        &'a self,
        text: &'a str,
        prompt: &'a str,
        reference_files: &'a [PathBuf],
        on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String>;

    fn translate_sync<'a>(
        &'a self,
        texts: &'a [String],
        prompt: &'a str,
        reference_files: &'a [PathBuf],
        skip_clear_wait: bool,
        timeout: Option<Duration>,
        include_item_ids: bool,
    ) -> BackendFuture<'a, Vec<String>>;
}

pub enum BackendImpl {
    Local(LocalClient),
    Copilot(CopilotClient),
}

impl BackendClient for BackendImpl {
    fn kind(&self) -> BackendKind {
        match self {
            BackendImpl::Local(client) => client.kind(),
            BackendImpl::Copilot(client) => client.kind(),
        }
    }

    fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        match self {
            BackendImpl::Local(client) => client.set_cancel_callback(callback),
            BackendImpl::Copilot(client) => client.set_cancel_callback(callback),
        }
    }

    fn translate_single<'a>(
        &'a self,
        text: &'a str,
        prompt: &'a str,
        reference_files: &'a [PathBuf],
        on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String> {
        match self {
            BackendImpl::Local(client) => {
                client.translate_single(text, prompt, reference_files, on_chunk)
            }
            BackendImpl::Copilot(client) => {
                client.translate_single(text, prompt, reference_files, on_chunk)
            }
        }
    }

    fn translate_sync<'a>(
        &'a self,
        texts: &'a [String],
        prompt: &'a str,
        reference_files: &'a [PathBuf],
        skip_clear_wait: bool,
        timeout: Option<Duration>,
        include_item_ids: bool,
    ) -> BackendFuture<'a, Vec<String>> {
        match self {
            BackendImpl::Local(client) => client.translate_sync(
                texts,
                prompt,
                reference_files,
                skip_clear_wait,
                timeout,
                include_item_ids,
            ),
            BackendImpl::Copilot(client) => client.translate_sync(
                texts,
                prompt,
                reference_files,
                skip_clear_wait,
                timeout,
                include_item_ids,
            ),
        }
    }
}

pub fn build_backend(kind: BackendKind, local: LocalConfig, copilot: CopilotConfig) -> BackendImpl {
    match kind {
        BackendKind::Local => BackendImpl::Local(LocalClient::new(local)),
        BackendKind::Copilot => BackendImpl::Copilot(CopilotClient::new(copilot)),
    }
}

/// Shared cancel-callback slot for clients.
#[derive(Default)]
pub(crate) struct CancelSlot {
    callback: Mutex<Option<CancelCallback>>,
}

impl CancelSlot {
    pub(crate) fn set(&self, callback: Option<CancelCallback>) {
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    pub(crate) fn get(&self) -> Option<CancelCallback> {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.get() {
            Some(callback) if callback() => Err(TranslationCancelled.into()),
            _ => Ok(()),
        }
    }
}

/// Awaits `future`, giving up with [`TranslationCancelled`] as soon as `cancel` fires.
pub(crate) async fn cancellable<T, F>(future: F, cancel: Option<CancelCallback>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(cancel) = cancel else {
        return future.await;
    };
    let mut future = pin!(future);
    loop {
        if cancel() {
            return Err(TranslationCancelled.into());
        }
        if let Ok(result) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            return result;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Model id and assistant text of a non-streamed chat completion.
pub(crate) fn parse_chat_completion(body: &str) -> Result<(Option<String>, String)> {
    let payload: ChatCompletion = serde_json::from_str(body)
        .map_err(|err| anyhow!("failed to parse chat completion JSON: {err}"))?;
    let choice = payload
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("chat completion returned no choices"))?;
    let content = choice
        .message
        .and_then(|message| message.content)
        .or(choice.text)
        .unwrap_or_default();
    let model = payload.model.filter(|model| !model.trim().is_empty());
    Ok((model, content))
}

/// Human-readable error from an OpenAI-style error body.
pub(crate) fn extract_error_message(body: &str) -> String {
    let fallback = || {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            "empty response body".to_string()
        } else {
            trimmed.chars().take(500).collect()
        }
    };
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return fallback();
    };
    let error = value.get("error").unwrap_or(&value);
    if let Some(message) = error.as_str() {
        return message.to_string();
    }
    let mut parts = Vec::new();
    if let Some(message) = error.get("message").and_then(Value::as_str)
        && !message.trim().is_empty()
    {
        parts.push(message.to_string());
    }
    if let Some(kind) = error.get("type").and_then(Value::as_str)
        && !kind.trim().is_empty()
    {
        parts.push(format!("type: {kind}"));
    }
    match error.get("code") {
        Some(Value::String(code)) if !code.trim().is_empty() => parts.push(format!("code: {code}")),
        Some(Value::Number(code)) => parts.push(format!("code: {code}")),
        _ => {}
    }
    if parts.is_empty() {
        fallback()
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_cancelled;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn chat_completion_content_and_model() {
        let body = r#"{"model":"qwen","choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        let (model, content) = parse_chat_completion(body).unwrap();
        assert_eq!(model.as_deref(), Some("qwen"));
        assert_eq!(content, "hi");

        let legacy = r#"{"choices":[{"text":"plain"}]}"#;
        assert_eq!(parse_chat_completion(legacy).unwrap().1, "plain");
        assert!(parse_chat_completion(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn error_messages_from_llama_and_openai_bodies() {
        let llama = r#"{"error":{"code":400,"message":"bad schema","type":"invalid_request_error"}}"#;
        assert_eq!(
            extract_error_message(llama),
            "bad schema | type: invalid_request_error | code: 400"
        );
        assert_eq!(extract_error_message(r#"{"error":"boom"}"#), "boom");
        assert_eq!(extract_error_message("gateway down"), "gateway down");
        assert_eq!(extract_error_message(""), "empty response body");
    }

    #[test]
    fn kinds_parse_and_concurrency() {
        assert_eq!(BackendKind::parse("Copilot"), Some(BackendKind::Copilot));
        assert_eq!(BackendKind::parse("local"), Some(BackendKind::Local));
        assert_eq!(BackendKind::parse("gemini"), None);
        assert!(BackendKind::Local.is_concurrency_safe());
        assert!(!BackendKind::Copilot.is_concurrency_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_aborts_pending_future() {
        let flag = Arc::new(AtomicBool::new(false));
        let observed = flag.clone();
        let cancel: CancelCallback = Arc::new(move || observed.load(Ordering::SeqCst));
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            setter.store(true, Ordering::SeqCst);
        });
        let never = std::future::pending::<Result<()>>();
        let err = cancellable(never, Some(cancel)).await.unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn cancellable_passes_through_results() {
        let cancel: CancelCallback = Arc::new(|| false);
        let value = cancellable(async { Ok(7) }, Some(cancel)).await.unwrap();
        assert_eq!(value, 7);
    }
}
