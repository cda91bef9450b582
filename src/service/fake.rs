use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::backend::{BackendClient, BackendFuture, BackendKind, CancelCallback, ChunkCallback};

type BatchResponder = Box<dyn Fn(&[String], &str) -> Result<Vec<String>> + Send + Sync>;

/// In-memory backend: batches are answered by a closure, single calls from a queue.
pub(crate) struct FakeBackend {
    kind: BackendKind,
    responder: BatchResponder,
    singles: Mutex<VecDeque<String>>,
    cancel: Mutex<Option<CancelCallback>>,
    batch_calls: Mutex<Vec<Vec<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub(crate) fn batches<F>(kind: BackendKind, responder: F) -> Arc<Self>
    where
        F: Fn(&[String], &str) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Arc::new(Self {
            kind,
            responder: Box::new(responder),
            singles: Mutex::new(VecDeque::new()),
            cancel: Mutex::new(None),
            batch_calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn singles(kind: BackendKind, replies: &[&str]) -> Arc<Self> {
        let fake = Self::batches(kind, |_, _| Err(anyhow!("no batch replies scripted")));
        *fake.singles.lock().unwrap() = replies.iter().map(|reply| reply.to_string()).collect();
        fake
    }

    pub(crate) fn batch_calls(&self) -> Vec<Vec<String>> {
        self.batch_calls.lock().unwrap().clone()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn has_cancel_callback(&self) -> bool {
        self.cancel.lock().unwrap().is_some()
    }
}

impl BackendClient for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        *self.cancel.lock().unwrap() = callback;
    }

    fn translate_single<'a>(
        &'a self,
        _text: &'a str,
        prompt: &'a str,
        _reference_files: &'a [PathBuf],
        on_chunk: Option<ChunkCallback>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = self
                .singles
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no single replies left"))?;
            if let Some(on_chunk) = on_chunk {
                on_chunk(&reply);
            }
            Ok(reply)
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
            self.batch_calls.lock().unwrap().push(texts.to_vec());
            self.prompts.lock().unwrap().push(prompt.to_string());
            (self.responder)(texts, prompt)
        })
    }
}
