pub mod markers;
pub mod payload;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::llm::adapter::{ChatMessage, FragmentStream, GenerationOptions, UpstreamTransport};
use futures::StreamExt;
use futures::stream::{self, BoxStream, Fuse};
use markers::{Utf8Decoder, has_continuation, strip_segments};
use payload::UpstreamPayload;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lazily relayed reply text.
pub type ChunkStream = BoxStream<'static, Result<String, RelayError>>;

/// Relays one conversation upstream and streams the reply back.
///
/// Each attempt runs a first pass whose fragments are cleaned of `$@$...$@$`
/// segments and, if any fragment carried the continuation marker, a second
/// pass relayed verbatim after a single `" "` chunk. A failure anywhere
/// restarts the whole attempt with fresh ids while `max_retries` allows,
/// so up to `max_retries + 1` attempts are made. Chunks already yielded by a
/// failed attempt stay in the output; the retry's chunks follow them.
///
/// The stream is pull-driven: nothing is read from upstream until the
/// consumer asks for the next chunk, and dropping the stream drops the
/// in-flight upstream body.
pub fn generate(
    transport: Arc<dyn UpstreamTransport>,
    config: Arc<RelayConfig>,
    conversation: Vec<ChatMessage>,
    options: GenerationOptions,
    max_retries: u32,
) -> ChunkStream {
    let run = RelayRun {
        transport,
        config,
        conversation,
        options,
        retries_left: max_retries,
        attempt: 0,
        phase: Phase::Start,
    };
    stream::unfold(run, |mut run| async move {
        let item = run.next_chunk().await?;
        Some((item, run))
    })
    .boxed()
}

struct RelayRun {
    transport: Arc<dyn UpstreamTransport>,
    config: Arc<RelayConfig>,
    conversation: Vec<ChatMessage>,
    options: GenerationOptions,
    retries_left: u32,
    attempt: u32,
    phase: Phase,
}

enum Phase {
    Start,
    First {
        payload: UpstreamPayload,
        body: Fuse<FragmentStream>,
        decoder: Utf8Decoder,
        accumulated: String,
        continuation: bool,
    },
    Continue {
        payload: UpstreamPayload,
    },
    Second {
        body: Fuse<FragmentStream>,
        decoder: Utf8Decoder,
    },
    Done,
}

enum Flow {
    Emit(String),
    Advance,
    Finished,
}

impl RelayRun {
    async fn next_chunk(&mut self) -> Option<Result<String, RelayError>> {
        loop {
            match self.step().await {
                Ok(Flow::Emit(chunk)) => return Some(Ok(chunk)),
                Ok(Flow::Advance) => continue,
                Ok(Flow::Finished) => return None,
                Err(e) if self.retries_left > 0 => {
                    warn!("relay attempt {} failed: {}, retrying...", self.attempt, e);
                    self.retries_left -= 1;
                    self.phase = Phase::Start;
                }
                Err(e) => {
                    error!("relay attempt {} failed, no retries left: {}", self.attempt, e);
                    self.phase = Phase::Done;
                    return Some(Err(e));
                }
            }
        }
    }

    async fn step(&mut self) -> Result<Flow, RelayError> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Start => {
                self.attempt += 1;
                let payload = UpstreamPayload::new(&self.conversation, &self.options, &self.config);
                info!("relay attempt {} session {}", self.attempt, payload.id);
                let body = self.transport.post_stream(payload.to_body()?).await?.fuse();
                self.phase = Phase::First {
                    payload,
                    body,
                    decoder: Utf8Decoder::default(),
                    accumulated: String::new(),
                    continuation: false,
                };
                Ok(Flow::Advance)
            }
            Phase::First {
                mut payload,
                mut body,
                mut decoder,
                mut accumulated,
                mut continuation,
            } => {
                let text = match body.next().await {
                    Some(fragment) => Some(decoder.decode(&fragment?)),
                    None => decoder.finish(),
                };
                let Some(text) = text else {
                    if !continuation {
                        return Ok(Flow::Finished);
                    }
                    debug!("continuation marker seen, requesting follow-up");
                    payload.continue_with(accumulated);
                    self.phase = Phase::Continue { payload };
                    return Ok(Flow::Emit(" ".to_string()));
                };
                let cleaned = strip_segments(&text).into_owned();
                continuation = continuation || has_continuation(&cleaned);
                accumulated.push_str(&cleaned);
                self.phase = Phase::First {
                    payload,
                    body,
                    decoder,
                    accumulated,
                    continuation,
                };
                if cleaned.is_empty() {
                    Ok(Flow::Advance)
                } else {
                    Ok(Flow::Emit(cleaned))
                }
            }
            Phase::Continue { payload } => {
                let body = self.transport.post_stream(payload.to_body()?).await?.fuse();
                self.phase = Phase::Second {
                    body,
                    decoder: Utf8Decoder::default(),
                };
                Ok(Flow::Advance)
            }
            Phase::Second {
                mut body,
                mut decoder,
            } => {
                let text = match body.next().await {
                    Some(fragment) => decoder.decode(&fragment?),
                    None => match decoder.finish() {
                        Some(tail) => tail,
                        None => return Ok(Flow::Finished),
                    },
                };
                self.phase = Phase::Second { body, decoder };
                if text.is_empty() {
                    Ok(Flow::Advance)
                } else {
                    Ok(Flow::Emit(text))
                }
            }
            Phase::Done => Ok(Flow::Finished),
        }
    }
}
