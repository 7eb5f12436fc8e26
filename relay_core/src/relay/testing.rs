use crate::error::RelayError;
use crate::llm::adapter::{FragmentStream, UpstreamTransport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted upstream answer.
pub enum Reply {
    Fragments(Vec<Result<Bytes, RelayError>>),
    Fail(RelayError),
}

impl Reply {
    pub fn ok(fragments: &[&str]) -> Self {
        Reply::Fragments(
            fragments
                .iter()
                .map(|f| Ok(Bytes::copy_from_slice(f.as_bytes())))
                .collect(),
        )
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Fail(RelayError::UpstreamHttp {
            status,
            body: body.to_string(),
        })
    }

    pub fn transport(msg: &str) -> Self {
        Reply::Fail(RelayError::Transport(msg.to_string()))
    }
}

/// In-memory upstream: answers from a script and records every payload it is sent.
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Value>>,
    released: Arc<AtomicBool>,
    pulled: Arc<AtomicUsize>,
}

impl ScriptedUpstream {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            released: Arc::new(AtomicBool::new(false)),
            pulled: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// True once the most recently handed out body has been dropped.
    pub fn body_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn fragments_pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedUpstream {
    async fn post_stream(&self, body: Bytes) -> Result<FragmentStream, RelayError> {
        let payload: Value = serde_json::from_slice(&body)?;
        self.requests.lock().unwrap().push(payload);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::transport("script exhausted"));
        match reply {
            Reply::Fail(e) => Err(e),
            Reply::Fragments(fragments) => {
                self.released.store(false, Ordering::SeqCst);
                let guard = ReleaseGuard(self.released.clone());
                let pulled = self.pulled.clone();
                let state = (fragments.into_iter(), guard, pulled);
                Ok(futures::stream::unfold(state, |(mut rest, guard, pulled)| async move {
                    let fragment = rest.next()?;
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Some((fragment, (rest, guard, pulled)))
                })
                .boxed())
            }
        }
    }
}
