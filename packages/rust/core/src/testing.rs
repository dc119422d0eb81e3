//! Scripted in-process fakes of the provider traits.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use intelhub_shared::{Credential, ProviderError};

use crate::provider::{BalanceQuery, CompletionProvider};

/// Replays scripted replies in order, then the fallback (if any).
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Mutex<Option<Result<String, ProviderError>>>,
    delay: Mutex<Option<Duration>>,
    credentials_used: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub(crate) fn push(&self, reply: Result<String, ProviderError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub(crate) fn push_ok(&self, raw: &str) {
        self.push(Ok(raw.to_string()));
    }

    pub(crate) fn set_fallback(&self, reply: Result<String, ProviderError>) {
        *self.fallback.lock().unwrap() = Some(reply);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.credentials_used.lock().unwrap().len()
    }

    pub(crate) fn credentials_used(&self) -> Vec<String> {
        self.credentials_used.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        _prompt: &str,
        _document_text: &str,
        credential: &Credential,
    ) -> Result<String, ProviderError> {
        self.credentials_used
            .lock()
            .unwrap()
            .push(credential.expose().to_string());
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(ProviderError::Transient("script exhausted".into()))),
        }
    }
}

/// Balance lookups keyed by the raw credential. One-shot results queued
/// with [`FakeBalance::push`] are served before the standing one.
#[derive(Default)]
pub(crate) struct FakeBalance {
    queued: Mutex<HashMap<String, VecDeque<Result<f64, ProviderError>>>>,
    balances: Mutex<HashMap<String, Result<f64, ProviderError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl FakeBalance {
    pub(crate) fn set(&self, key: &str, result: Result<f64, ProviderError>) {
        self.balances.lock().unwrap().insert(key.to_string(), result);
    }

    pub(crate) fn push(&self, key: &str, result: Result<f64, ProviderError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn set_delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceQuery for FakeBalance {
    async fn query_balance(&self, credential: &Credential) -> Result<f64, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(credential.expose()).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(credential.expose())
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        self.balances
            .lock()
            .unwrap()
            .get(credential.expose())
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Transient("no scripted balance".into())))
    }
}
