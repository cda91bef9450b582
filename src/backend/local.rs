use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::capability::{CapabilityCache, DEFAULT_CAPABILITY_TTL, ResponseFormatSupport};
use super::stream::{SseEvent, SseParser, StreamCoalescer, event_delta, event_model};
use super::transport::{ChatTransport, ReqwestTransport, StreamReply};
use super::{
    BackendClient, BackendFuture, BackendKind, CancelCallback, CancelSlot, ChunkCallback,
    cancellable, extract_error_message, parse_chat_completion,
};
use crate::clock::{SharedClock, system_clock};
use crate::error::LocalPromptTooLong;
use crate::parsers::{
    clean_batch_translation, expected_json_root_key, loads_json_loose, parse_batch_translations,
};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const MAX_REQUEST_ATTEMPTS: usize = 4;
const PROMPT_TOO_LONG_DETAIL_CHARS: usize = 200;
const SAMPLING_PARAMS: [&str; 4] = ["top_p", "top_k", "min_p", "repeat_penalty"];

static RESPONSE_FORMAT_REJECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)response_format|json_schema|json schema|grammar").expect("valid regex")
});

static CONTEXT_OVERFLOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)context|n_ctx|ctx_size|too long|exceed|too many tokens").expect("valid regex")
});

/// Connection and sampling settings for an OpenAI-compatible llama.cpp server.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub prompt_repeat_retry: bool,
    pub capability_ttl: Duration,
    pub request_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            model: "local-model".to_string(),
            temperature: 0.2,
            max_tokens: None,
            top_p: None,
            top_k: None,
            min_p: None,
            repeat_penalty: None,
            stop: Vec::new(),
            stream: true,
            prompt_repeat_retry: true,
            capability_ttl: DEFAULT_CAPABILITY_TTL,
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl LocalConfig {
    fn sampling_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(value) = self.top_p {
            params.insert("top_p".to_string(), json!(value));
        }
        if let Some(value) = self.top_k {
            params.insert("top_k".to_string(), json!(value));
        }
        if let Some(value) = self.min_p {
            params.insert("min_p".to_string(), json!(value));
        }
        if let Some(value) = self.repeat_penalty {
            params.insert("repeat_penalty".to_string(), json!(value));
        }
        params
    }
}

/// How one HTTP exchange ended.
enum Exchange {
    Content(String),
    Rejected { status: u16, body: String },
}

pub struct LocalClient {
    config: LocalConfig,
    transport: Arc<dyn ChatTransport>,
    capabilities: CapabilityCache,
    cancel: CancelSlot,
    clock: SharedClock,
}

impl LocalClient {
    pub fn new(config: LocalConfig) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::new()), system_clock())
    }

    pub fn with_transport(
        config: LocalConfig,
        transport: Arc<dyn ChatTransport>,
        clock: SharedClock,
    ) -> Self {
        let capabilities = CapabilityCache::new(config.capability_ttl, clock.clone());
        Self {
            config,
            transport,
            capabilities,
            cancel: CancelSlot::default(),
            clock,
        }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityCache {
        &self.capabilities
    }

    fn url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        )
    }

    fn runtime_key(&self) -> String {
        CapabilityCache::runtime_key(&self.config.base_url, &self.config.model)
    }

    fn request_body(
        &self,
        prompt: &str,
        stream: bool,
        format: Option<(ResponseFormatSupport, &str)>,
        sampling: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.config.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if sampling && let Value::Object(map) = &mut body {
            map.extend(self.config.sampling_params());
        }
        if let Some((support, root_key)) = format
            && let Some(response_format) = response_format(support, root_key)
        {
            body["response_format"] = response_format;
        }
        if !self.config.stop.is_empty() {
            body["stop"] = json!(self.config.stop);
        }
        body
    }

    /// One completion, adapting the request to what the server accepts.
    async fn complete(
        &self,
        prompt: &str,
        on_chunk: Option<&ChunkCallback>,
        timeout: Duration,
    ) -> Result<String> {
        let key = self.runtime_key();
        let root_key = expected_json_root_key(prompt);
        let mut format = root_key.map(|_| self.capabilities.response_format(&key));
        let mut sampling = self.capabilities.sampling_params_supported(&key)
            && !self.config.sampling_params().is_empty();
        let mut degenerate_retry_used = false;

        for attempt in 1..=MAX_REQUEST_ATTEMPTS {
            self.cancel.check()?;
            let requested_format = format.zip(root_key);
            let body = self.request_body(prompt, on_chunk.is_some(), requested_format, sampling);
            let exchange = match on_chunk {
                Some(on_chunk) => self.exchange_streaming(&body, on_chunk, timeout).await?,
                None => self.exchange(&body, timeout).await?,
            };
            match exchange {
                Exchange::Content(content) => {
                    let formatted = matches!(
                        format,
                        Some(ResponseFormatSupport::Schema | ResponseFormatSupport::JsonObject)
                    );
                    if formatted && !degenerate_retry_used && is_degenerate_json(&content) {
                        warn!(
                            "local AI returned empty JSON with response_format; retrying without it (attempt {})",
                            attempt
                        );
                        degenerate_retry_used = true;
                        format = Some(ResponseFormatSupport::None);
                        continue;
                    }
                    return Ok(content);
                }
                Exchange::Rejected { status, body } => {
                    if let Some(current) = format
                        && current != ResponseFormatSupport::None
                        && is_response_format_rejection(status, &body)
                    {
                        let downgraded = current.downgrade();
                        info!(
                            "local AI rejected response_format {}; using {}",
                            current.as_str(),
                            downgraded.as_str()
                        );
                        self.capabilities.record_response_format(&key, downgraded);
                        format = Some(downgraded);
                        continue;
                    }
                    if sampling && is_sampling_rejection(status, &body) {
                        info!("local AI rejected sampling parameters; sending without them");
                        self.capabilities.record_sampling_params(&key, false);
                        sampling = false;
                        continue;
                    }
                    if status == 400 && CONTEXT_OVERFLOW.is_match(&body) {
                        return Err(LocalPromptTooLong {
                            detail: extract_error_message(&body)
                                .chars()
                                .take(PROMPT_TOO_LONG_DETAIL_CHARS)
                                .collect(),
                        }
                        .into());
                    }
                    return Err(anyhow!(
                        "local AI server error ({}): {}",
                        status,
                        extract_error_message(&body)
                    ));
                }
            }
        }
        Err(anyhow!(
            "local AI server rejected the request {} times",
            MAX_REQUEST_ATTEMPTS
        ))
    }

    async fn exchange(&self, body: &Value, timeout: Duration) -> Result<Exchange> {
        let url = self.url();
        let reply = cancellable(
            self.transport.post_json(&url, body, None, timeout),
            self.cancel.get(),
        )
        .await
        .with_context(|| format!("failed to reach local AI server at {url}"))?;
        if !reply.is_success() {
            return Ok(Exchange::Rejected {
                status: reply.status,
                body: reply.body,
            });
        }
        let (model, content) = parse_chat_completion(&reply.body)?;
        if let Some(model) = model {
            debug!("local AI model: {}", model);
        }
        Ok(Exchange::Content(content))
    }

    async fn exchange_streaming(
        &self,
        body: &Value,
        on_chunk: &ChunkCallback,
        timeout: Duration,
    ) -> Result<Exchange> {
        let url = self.url();
        let reply = cancellable(
            self.transport.post_stream(&url, body, None, timeout),
            self.cancel.get(),
        )
        .await
        .with_context(|| format!("failed to reach local AI server at {url}"))?;
        if !reply.is_success() {
            let status = reply.status;
            return Ok(Exchange::Rejected {
                status,
                body: reply.into_text().await,
            });
        }
        self.read_stream(reply, on_chunk).await.map(Exchange::Content)
    }

    async fn read_stream(&self, reply: StreamReply, on_chunk: &ChunkCallback) -> Result<String> {
        let mut chunks = reply.chunks;
        let mut parser = SseParser::new();
        let mut state = StreamState::new(StreamCoalescer::new(self.clock.clone()));
        let mut done = false;
        while !done {
            let next = cancellable(
                async { Ok::<_, anyhow::Error>(chunks.next().await) },
                self.cancel.get(),
            )
            .await?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.context("failed to read local AI stream")?;
            for event in parser.push(&chunk) {
                if state.apply(event, on_chunk) {
                    done = true;
                    break;
                }
            }
            self.cancel.check()?;
        }
        if !done && let Some(event) = parser.finish() {
            state.apply(event, on_chunk);
        }
        if let Some(rest) = state.coalescer.flush() {
            on_chunk(&rest);
        }
        Ok(state.content)
    }

    /// A completion plus the repeated-prompt retry for replies missing the JSON root.
    async fn chat(
        &self,
        prompt: &str,
        on_chunk: Option<ChunkCallback>,
        timeout: Duration,
    ) -> Result<String> {
        let content = self.complete(prompt, on_chunk.as_ref(), timeout).await?;
        let Some(root_key) = expected_json_root_key(prompt) else {
            return Ok(content);
        };
        if !self.config.prompt_repeat_retry || has_root_key(&content, root_key) {
            return Ok(content);
        }
        warn!(
            "local AI reply has no `{}` key; retrying once with the prompt repeated",
            root_key
        );
        let repeated = format!("{prompt}\n\n{prompt}");
        let retried = self.complete(&repeated, None, timeout).await?;
        if has_root_key(&retried, root_key) || content.trim().is_empty() {
            Ok(retried)
        } else {
            Ok(content)
        }
    }
}

struct StreamState {
    content: String,
    coalescer: StreamCoalescer,
    model_logged: bool,
}

impl StreamState {
    fn new(coalescer: StreamCoalescer) -> Self {
        Self {
            content: String::new(),
            coalescer,
            model_logged: false,
        }
    }

    /// Returns true on the terminating event.
    fn apply(&mut self, event: SseEvent, on_chunk: &ChunkCallback) -> bool {
        let value = match event {
            SseEvent::Done => return true,
            SseEvent::Data(value) => value,
        };
        if !self.model_logged && let Some(model) = event_model(&value) {
            debug!("local AI model: {}", model);
            self.model_logged = true;
        }
        if let Some(delta) = event_delta(&value) {
            self.content.push_str(delta);
            if let Some(emitted) = self.coalescer.feed(delta) {
                on_chunk(&emitted);
            }
        }
        false
    }
}

impl BackendClient for LocalClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        self.cancel.set(callback);
    }

    fn translate_single<'a>(
        &'a self,
        text: &'a str,
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            debug!(
                "local AI single request (text_chars={} prompt_chars={})",
                text.chars().count(),
                prompt.chars().count()
            );
            let on_chunk = on_chunk.filter(|_| self.config.stream);
            self.chat(prompt, on_chunk, self.config.request_timeout).await
        })
    }

    fn translate_sync<'a>(
        &'a self,
        texts: &'a [String],
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        _skip_clear_wait: bool,
        timeout: Option<Duration>,
        _include_item_ids: bool,
    ) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            debug!(
                "local AI batch request (items={} prompt_chars={})",
                texts.len(),
                prompt.chars().count()
            );
            let timeout = timeout.unwrap_or(self.config.request_timeout);
            let raw = self.chat(prompt, None, timeout).await?;
            let parsed = parse_batch_translations(&raw, texts.len())?;
            Ok(parsed
                .iter()
                .map(|translation| clean_batch_translation(translation))
                .collect())
        })
    }
}

fn response_format(support: ResponseFormatSupport, root_key: &str) -> Option<Value> {
    match support {
        ResponseFormatSupport::Schema => Some(json!({
            "type": "json_schema",
            "json_schema": {
                "name": format!("yakulingo_{root_key}"),
                "schema": response_schema(root_key),
            }
        })),
        ResponseFormatSupport::JsonObject => Some(json!({"type": "json_object"})),
        ResponseFormatSupport::None => None,
    }
}

fn response_schema(root_key: &str) -> Value {
    match root_key {
        "items" => json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "translation": {"type": "string"}
                        },
                        "required": ["id", "translation"]
                    }
                }
            },
            "required": ["items"]
        }),
        "options" => json!({
            "type": "object",
            "properties": {
                "options": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "style": {"type": "string"},
                            "translation": {"type": "string"},
                            "explanation": {"type": "string"}
                        },
                        "required": ["style", "translation"]
                    }
                }
            },
            "required": ["options"]
        }),
        _ => json!({
            "type": "object",
            "properties": {
                "translation": {"type": "string"},
                "explanation": {"type": "string"}
            },
            "required": ["translation"]
        }),
    }
}

fn is_response_format_rejection(status: u16, body: &str) -> bool {
    matches!(status, 400 | 422 | 500) && RESPONSE_FORMAT_REJECTION.is_match(body)
}

fn is_sampling_rejection(status: u16, body: &str) -> bool {
    matches!(status, 400 | 422) && SAMPLING_PARAMS.iter().any(|param| body.contains(param))
}

/// `""`, `{}` or `[]`: the server accepted a schema but produced nothing.
fn is_degenerate_json(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map.is_empty(),
        Ok(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn has_root_key(content: &str, root_key: &str) -> bool {
    loads_json_loose(content).is_some_and(|value| value.get(root_key).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::transport::fake::{FakeTransport, Scripted};
    use crate::clock::ManualClock;
    use crate::error::{is_cancelled, is_prompt_too_long};
    use std::sync::Mutex;

    const JSON_PROMPT: &str =
        "Return {\"translation\": \"...\", \"explanation\": \"...\"}\n===INPUT_TEXT===\n売上\n===END_INPUT_TEXT===";

    fn client(config: LocalConfig, replies: Vec<Scripted>) -> (LocalClient, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(replies));
        let client = LocalClient::with_transport(
            config,
            transport.clone(),
            Arc::new(ManualClock::new()),
        );
        (client, transport)
    }

    fn non_streaming() -> LocalConfig {
        LocalConfig {
            stream: false,
            ..LocalConfig::default()
        }
    }

    #[tokio::test]
    async fn json_prompt_requests_schema_format() {
        let (client, transport) = client(
            non_streaming(),
            vec![Scripted::ok_content(r#"{"translation":"Sales","explanation":""}"#)],
        );
        let content = client
            .translate_single("売上", JSON_PROMPT, &[], None)
            .await
            .unwrap();
        assert_eq!(content, r#"{"translation":"Sales","explanation":""}"#);
        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["stream"], json!(false));
        assert_eq!(bodies[0]["response_format"]["type"], json!("json_schema"));
        assert_eq!(
            bodies[0]["response_format"]["json_schema"]["schema"]["required"],
            json!(["translation"])
        );
        assert!(bodies[0].get("top_k").is_none());
    }

    #[tokio::test]
    async fn schema_rejection_downgrades_and_is_remembered() {
        let (client, transport) = client(
            non_streaming(),
            vec![
                Scripted::error(400, r#"{"error":{"code":400,"message":"json_schema is not supported"}}"#),
                Scripted::ok_content(r#"{"translation":"A"}"#),
                Scripted::ok_content(r#"{"translation":"B"}"#),
            ],
        );
        let first = client.translate_single("x", JSON_PROMPT, &[], None).await.unwrap();
        assert_eq!(first, r#"{"translation":"A"}"#);
        client.translate_single("x", JSON_PROMPT, &[], None).await.unwrap();

        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[1]["response_format"], json!({"type": "json_object"}));
        assert_eq!(bodies[2]["response_format"], json!({"type": "json_object"}));
        assert_eq!(
            client.capabilities().response_format(&client.runtime_key()),
            ResponseFormatSupport::JsonObject
        );
    }

    #[tokio::test]
    async fn sampling_rejection_drops_params() {
        let config = LocalConfig {
            top_k: Some(40),
            repeat_penalty: Some(1.1),
            ..non_streaming()
        };
        let (client, transport) = client(
            config,
            vec![
                Scripted::error(400, "unknown field: top_k"),
                Scripted::ok_content("plain text"),
            ],
        );
        let content = client.translate_single("x", "translate: 売上", &[], None).await.unwrap();
        assert_eq!(content, "plain text");
        let bodies = transport.bodies();
        assert_eq!(bodies[0]["top_k"], json!(40));
        assert!(bodies[1].get("top_k").is_none());
        assert!(bodies[1].get("response_format").is_none());
        assert!(!client.capabilities().sampling_params_supported(&client.runtime_key()));
    }

    #[tokio::test]
    async fn context_overflow_is_prompt_too_long() {
        let (client, _) = client(
            non_streaming(),
            vec![Scripted::error(
                400,
                r#"{"error":{"message":"the request exceeds the available context size"}}"#,
            )],
        );
        let err = client
            .translate_single("x", "plain prompt", &[], None)
            .await
            .unwrap_err();
        assert!(is_prompt_too_long(&err));
    }

    #[tokio::test]
    async fn other_failures_report_status() {
        let (client, _) = client(non_streaming(), vec![Scripted::error(500, "boom")]);
        let err = client
            .translate_single("x", "plain prompt", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "local AI server error (500): boom");
    }

    #[tokio::test]
    async fn empty_json_retries_without_format() {
        let (client, transport) = client(
            non_streaming(),
            vec![
                Scripted::ok_content("{}"),
                Scripted::ok_content(r#"{"translation":"Hi"}"#),
            ],
        );
        let content = client.translate_single("x", JSON_PROMPT, &[], None).await.unwrap();
        assert_eq!(content, r#"{"translation":"Hi"}"#);
        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[1].get("response_format").is_none());
    }

    #[tokio::test]
    async fn missing_root_key_repeats_prompt_once() {
        let (client, transport) = client(
            non_streaming(),
            vec![
                Scripted::ok_content("Sure, here it is"),
                Scripted::ok_content(r#"{"translation":"Sales"}"#),
            ],
        );
        let content = client.translate_single("x", JSON_PROMPT, &[], None).await.unwrap();
        assert_eq!(content, r#"{"translation":"Sales"}"#);
        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(
            bodies[1]["messages"][0]["content"],
            json!(format!("{JSON_PROMPT}\n\n{JSON_PROMPT}"))
        );
    }

    #[tokio::test]
    async fn repeat_retry_can_be_disabled() {
        let config = LocalConfig {
            prompt_repeat_retry: false,
            ..non_streaming()
        };
        let (client, transport) = client(config, vec![Scripted::ok_content("Sure")]);
        let content = client.translate_single("x", JSON_PROMPT, &[], None).await.unwrap();
        assert_eq!(content, "Sure");
        assert_eq!(transport.bodies().len(), 1);
    }

    #[tokio::test]
    async fn streaming_coalesces_and_returns_full_text() {
        let chunks = vec![
            "data: {\"model\":\"qwen\",\"choices\":[{\"delta\":{\"content\":\"Net \"}}]}\n\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"sales\"}}]}\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\" rose\"}}]}\ndata: [DONE]\n".to_string(),
        ];
        let (client, transport) = client(
            LocalConfig::default(),
            vec![Scripted::Stream { status: 200, chunks }],
        );
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let on_chunk: ChunkCallback = Arc::new(move |text: &str| {
            sink.lock().unwrap().push(text.to_string());
        });
        let content = client
            .translate_single("売上", "plain prompt", &[], Some(on_chunk))
            .await
            .unwrap();
        assert_eq!(content, "Net sales rose");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Net ".to_string(), "sales rose".to_string()]
        );
        assert_eq!(transport.bodies()[0]["stream"], json!(true));
    }

    #[tokio::test]
    async fn cancelled_before_request() {
        let (client, transport) = client(non_streaming(), vec![Scripted::ok_content("x")]);
        client.set_cancel_callback(Some(Arc::new(|| true)));
        let err = client
            .translate_single("x", "plain prompt", &[], None)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(transport.bodies().is_empty());
    }

    #[tokio::test]
    async fn batch_replies_are_parsed_and_cleaned() {
        let reply = r#"{"items":[{"id":2,"translation":"[[ID:2]] Operating profit"},{"id":1,"translation":"Net sales"}]}"#;
        let (client, transport) = client(non_streaming(), vec![Scripted::ok_content(reply)]);
        let texts = vec!["売上高".to_string(), "営業利益".to_string()];
        let prompt = "Return {\"items\": [...]}\n===INPUT_TEXT===\n...";
        let translations = client
            .translate_sync(&texts, prompt, &[], false, Some(Duration::from_secs(5)), true)
            .await
            .unwrap();
        assert_eq!(translations, vec!["Net sales", "Operating profit"]);
        assert_eq!(
            transport.bodies()[0]["response_format"]["json_schema"]["name"],
            json!("yakulingo_items")
        );
    }
}
