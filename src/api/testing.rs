//! In-memory `Transport` for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{ApiPath, HttpError, Method, Transport};

type Reply = Result<Value, HttpError>;

enum Scripted {
    Ready(Reply),
    Deferred(oneshot::Receiver<Reply>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// Replies are queued per `(method, path)` and consumed in order. An
/// unscripted call fails like a refused connection.
#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, method: Method, path: &str, reply: Reply) {
        self.push(method, path, Scripted::Ready(reply));
    }

    /// The call blocks until the returned sender fires.
    pub fn hold(&self, method: Method, path: &str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.push(method, path, Scripted::Deferred(rx));
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(&self, method: Method, path: &str, item: Scripted) {
        if let Ok(mut q) = self.queue.lock() {
            q.entry((method, path.to_string())).or_default().push_back(item);
        }
    }

    async fn answer(&self, method: Method, path: &ApiPath, body: Option<Value>) -> Reply {
        let path = path.to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call { method, path: path.clone(), body });
        }
        let next = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(&(method, path.clone())).and_then(VecDeque::pop_front));
        match next {
            Some(Scripted::Ready(reply)) => reply,
            Some(Scripted::Deferred(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(HttpError::transport("reply dropped"))),
            None => Err(HttpError::transport(format!("connection refused: {}", path))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, path: &ApiPath) -> Result<Value, HttpError> {
        self.answer(Method::Get, path, None).await
    }

    async fn post(&self, path: &ApiPath, body: Option<Value>) -> Result<Value, HttpError> {
        self.answer(Method::Post, path, body).await
    }
}
