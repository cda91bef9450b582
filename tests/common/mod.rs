#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};
use yakulingo_core::backend::transport::{ChatTransport, HttpReply, StreamReply, TransportFuture};
use yakulingo_core::backend::{BackendFuture, CancelCallback, ChunkCallback};
use yakulingo_core::{BackendClient, BackendKind};

type BatchFn = Box<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

/// Backend answering single calls from a queue and batches through a closure.
pub struct ScriptedBackend {
    kind: BackendKind,
    singles: Mutex<VecDeque<String>>,
    batch: BatchFn,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn singles(kind: BackendKind, replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            kind,
            singles: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
            batch: Box::new(|texts| texts.to_vec()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn batches<F>(kind: BackendKind, batch: F) -> Arc<Self>
    where
        F: Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            kind,
            singles: Mutex::new(VecDeque::new()),
            batch: Box::new(batch),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl BackendClient for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn set_cancel_callback(&self, _callback: Option<CancelCallback>) {}

    fn translate_single<'a>(
        &'a self,
        _text: &'a str,
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        _on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.singles
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted reply left"))
        })
    }

    fn translate_sync<'a>(
        &'a self,
        texts: &'a [String],
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        _skip_clear_wait: bool,
        _timeout: Option<Duration>,
        _include_item_ids: bool,
    ) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok((self.batch)(texts))
        })
    }
}

/// Chat endpoint replaying OpenAI-style completions; streaming is not scripted.
#[derive(Default)]
pub struct ReplayTransport {
    contents: Mutex<VecDeque<String>>,
    pub bodies: Mutex<Vec<Value>>,
}

impl ReplayTransport {
    pub fn new(contents: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            contents: Mutex::new(contents.iter().map(|content| content.to_string()).collect()),
            bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

impl ChatTransport for ReplayTransport {
    fn post_json<'a>(
        &'a self,
        _url: &'a str,
        body: &'a Value,
        _bearer: Option<&'a str>,
        _timeout: Duration,
    ) -> TransportFuture<'a, HttpReply> {
        Box::pin(async move {
            self.bodies.lock().unwrap().push(body.clone());
            let content = self
                .contents
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted completion left"))?;
            Ok(HttpReply {
                status: 200,
                body: json!({
                    "model": "local-model",
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                })
                .to_string(),
                retry_after: None,
            })
        })
    }

    fn post_stream<'a>(
        &'a self,
        _url: &'a str,
        _body: &'a Value,
        _bearer: Option<&'a str>,
        _timeout: Duration,
    ) -> TransportFuture<'a, StreamReply> {
        Box::pin(async move { Err::<StreamReply, _>(anyhow!("streaming is not scripted")) })
    }
}

pub fn result_phases(metadata: Option<&serde_json::Map<String, Value>>) -> Vec<String> {
    metadata
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
