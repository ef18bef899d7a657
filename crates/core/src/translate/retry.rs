//! Chunk retry engine.
//! Drives one chunk through the session client until its reply passes the
//! exact cue-count check or the retry budget runs out.

use super::{strip_framing, ChatBackend, PromptContext, Session, SessionClient};
use crate::config::Settings;
use crate::error::{Result, TranslateError};
use crate::events::{EventSink, QueueEvent};
use crate::queue::{CancelToken, JobId};
use crate::subtitle::validate::{count_units, validate_chunk};
use crate::subtitle::Chunk;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Backoff and budget knobs for chunk attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_delay_step: Duration,
    pub max_chunk_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            rate_limit_cooldown: Duration::from_millis(settings.rate_limit_cooldown_ms),
            rate_limit_delay_step: Duration::from_millis(settings.rate_limit_delay_step_ms),
            max_chunk_delay: Duration::from_millis(settings.max_chunk_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, err: &TranslateError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1 << exponent);
        if err.is_rate_limit() {
            delay.saturating_add(self.rate_limit_cooldown)
        } else {
            delay
        }
    }
}

/// Inter-chunk delay shared between the retry engine, which raises it under
/// rate-limit pressure, and the orchestrator, which waits on it.
#[derive(Debug, Clone)]
pub struct Throttle {
    delay_ms: Arc<AtomicU64>,
}

impl Throttle {
    pub fn new(initial: Duration) -> Self {
        Self {
            delay_ms: Arc::new(AtomicU64::new(saturating_millis(initial))),
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }

    /// Increase the delay by `step`, never beyond `max`. Returns the new value.
    pub fn raise(&self, step: Duration, max: Duration) -> Duration {
        let step = saturating_millis(step);
        let max = saturating_millis(max);
        // A delay configured above `max` is left alone rather than lowered.
        let bump = |current: u64| current.saturating_add(step).min(max.max(current));
        let previous = self
            .delay_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| Some(bump(current)))
            .unwrap_or_else(|current| current);
        Duration::from_millis(bump(previous))
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs chunks against one backend with a shared policy and throttle.
pub struct RetryEngine<B> {
    client: SessionClient<B>,
    policy: RetryPolicy,
    throttle: Throttle,
    events: EventSink,
}

impl<B: ChatBackend> RetryEngine<B> {
    pub fn new(
        client: SessionClient<B>,
        policy: RetryPolicy,
        throttle: Throttle,
        events: EventSink,
    ) -> Self {
        Self {
            client,
            policy,
            throttle,
            events,
        }
    }

    pub fn client(&self) -> &SessionClient<B> {
        &self.client
    }

    /// Translate `chunk`, reusing and updating the job's `session`.
    /// Returns the trimmed translated cues. On failure the session is
    /// discarded so the next attempt starts a fresh conversation.
    pub async fn run_chunk(
        &self,
        session: &mut Option<Session>,
        job: JobId,
        chunk: &Chunk,
        total_chunks: usize,
        ctx: &PromptContext,
        cancel: &CancelToken,
    ) -> Result<String> {
        let expected = count_units(&chunk.text);
        let max_attempts = self.policy.max_attempts();
        let number = chunk.index + 1;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            attempt += 1;
            trace!("run_chunk job={job} chunk={number}/{total_chunks} attempt={attempt}");
            let result = self
                .attempt(session.take(), job, chunk, expected, ctx)
                .await;
            if cancel.is_cancelled() {
                if let Ok((s, _)) = result {
                    self.client.discard(s);
                }
                return Err(TranslateError::Cancelled);
            }
            let err = match result {
                Ok((s, text)) => {
                    *session = Some(s);
                    if attempt > 1 {
                        self.events.info(format!(
                            "{job}: chunk {number}/{total_chunks} succeeded on attempt {attempt}"
                        ));
                    }
                    return Ok(text);
                }
                Err(err) => err,
            };
            // Every rate limit counts, including one that ends the chunk.
            if err.is_rate_limit() {
                let raised = self
                    .throttle
                    .raise(self.policy.rate_limit_delay_step, self.policy.max_chunk_delay);
                self.events.warn(format!(
                    "Rate limited, inter-chunk delay is now {:.1}s",
                    raised.as_secs_f64()
                ));
            }
            if attempt >= max_attempts {
                return Err(TranslateError::ChunkExhausted {
                    chunk: number,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = self.policy.backoff(attempt, &err);
            self.events.warn(format!(
                "{job}: chunk {number}/{total_chunks} attempt {attempt}/{max_attempts} failed: {err}. Retrying in {:.1}s",
                delay.as_secs_f64()
            ));
            if !cancel.sleep(delay).await {
                return Err(TranslateError::Cancelled);
            }
        }
    }

    /// One call: send, drain the stream, strip framing, validate.
    async fn attempt(
        &self,
        session: Option<Session>,
        job: JobId,
        chunk: &Chunk,
        expected: usize,
        ctx: &PromptContext,
    ) -> Result<(Session, String)> {
        let (mut session, mut stream) = self.client.send(session, &chunk.text, ctx).await?;
        let mut reply = String::new();
        let mut received = 0;
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(fragment) => {
                    received += fragment.chars().count();
                    reply.push_str(&fragment);
                    self.events.emit(QueueEvent::Partial {
                        job,
                        chunk: chunk.index,
                        received,
                    });
                }
                Err(err) => {
                    self.client.discard(session);
                    return Err(err);
                }
            }
        }
        let text = strip_framing(&reply);
        if let Err(err) = validate_chunk(expected, &text) {
            debug!("rejecting reply for chunk {}: {err}", chunk.index + 1);
            self.client.discard(session);
            return Err(err);
        }
        session.record_reply(&text);
        Ok((session, text))
    }
}
