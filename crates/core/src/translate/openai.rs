//! OpenAI-compatible chat backend.
//! This posts the conversation to `/chat/completions` with streaming enabled
//! and turns the server-sent events into reply fragments.

use super::{ChatBackend, ChatMessage, FragmentStream};
use crate::error::{Result, TranslateError};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Longest silence tolerated between two reads of a streamed reply.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Backend that delegates to an OpenAI-style chat completion API.
pub struct OpenAiBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    idle_timeout: Duration,
}

impl OpenAiBackend {
    /// Create a backend for `endpoint` (e.g. `https://api.openai.com/v1`).
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            idle_timeout: STREAM_IDLE_TIMEOUT,
        })
    }

    /// Fail a reply when the server sends nothing for `timeout`. This also
    /// bounds the wait for response headers.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    /// Send the transcript and return the streamed answer.
    async fn stream_reply(&self, transcript: &[ChatMessage]) -> Result<FragmentStream> {
        trace!("stream_reply model={} turns={}", self.model, transcript.len());
        let body = json!({
            "model": self.model,
            "stream": true,
            "messages": transcript,
        });
        let request = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let resp = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| stalled(self.idle_timeout))??;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TranslateError::transport(format!(
                "chat API error ({status}): {text}"
            )));
        }
        Ok(sse_fragments(resp.bytes_stream(), self.idle_timeout))
    }
}

fn stalled(timeout: Duration) -> TranslateError {
    TranslateError::transport(format!(
        "chat API sent no data for {}s",
        timeout.as_secs_f64()
    ))
}

/// Parser state for one event stream.
struct SseState {
    inner: stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<String>>,
    idle_timeout: Duration,
    done: bool,
}

impl SseState {
    /// Consume every complete line in the buffer.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim());
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            debug!("skipping malformed event payload: {payload}");
            return;
        };
        if let Some(message) = value["error"]["message"].as_str() {
            self.pending.push_back(Err(TranslateError::transport(message)));
            self.done = true;
            return;
        }
        if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
            if !content.is_empty() {
                self.pending.push_back(Ok(content.to_string()));
            }
        }
    }
}

/// Turn a raw byte stream of server-sent events into content fragments.
/// Lines are only decoded once complete so multi-byte characters split
/// across network chunks survive. A read that takes longer than
/// `idle_timeout` ends the stream with an error.
pub(crate) fn sse_fragments<S, B>(inner: S, idle_timeout: Duration) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
{
    let state = SseState {
        inner: inner.map(|r| r.map(|b| b.as_ref().to_vec())).boxed(),
        buf: Vec::new(),
        pending: VecDeque::new(),
        idle_timeout,
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            let Ok(next) = tokio::time::timeout(st.idle_timeout, st.inner.next()).await else {
                st.done = true;
                debug!("event stream idle for {:?}, giving up", st.idle_timeout);
                return Some((Err(stalled(st.idle_timeout)), st));
            };
            match next {
                Some(Ok(bytes)) => {
                    st.buf.extend_from_slice(&bytes);
                    st.drain_lines();
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err.into()), st));
                }
                None => {
                    st.buf.push(b'\n');
                    st.drain_lines();
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportKind;
    use crate::translate::ChatRole;
    use httpmock::prelude::*;

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: ChatRole::User,
            content: content.to_string(),
        }]
    }

    #[tokio::test]
    async fn parses_fragments_across_split_network_chunks() {
        let body = format!("{}{}data: [DONE]\n\n", event("Olá, "), event("mundo"));
        let bytes = body.into_bytes();
        // Cut inside the multi-byte `á` and inside a line.
        let pieces: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(bytes[..42].to_vec()),
            Ok(bytes[42..53].to_vec()),
            Ok(bytes[53..].to_vec()),
        ];
        let fragments: Vec<String> = sse_fragments(stream::iter(pieces), STREAM_IDLE_TIMEOUT)
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments.concat(), "Olá, mundo");
    }

    #[tokio::test]
    async fn in_stream_error_ends_the_stream() {
        let body = format!(
            "{}data: {}\n\n{}",
            event("partial"),
            json!({"error": {"message": "quota exceeded"}}),
            event("ignored")
        );
        let items: Vec<Result<String>> =
            sse_fragments(
                stream::iter(vec![Ok::<_, reqwest::Error>(body.into_bytes())]),
                STREAM_IDLE_TIMEOUT,
            )
                .collect()
                .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(items[1].as_ref().unwrap_err().is_rate_limit());
    }

    #[tokio::test]
    async fn stalled_stream_fails_after_idle_timeout() {
        let first: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(event("Oi").into_bytes())];
        let inner = stream::iter(first).chain(stream::pending());
        let items: Vec<Result<String>> = sse_fragments(inner, Duration::from_millis(50))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Oi");
        let err = items[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("sent no data"), "{err}");
        assert!(!err.is_rate_limit());
    }

    #[tokio::test]
    async fn slow_response_headers_time_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).delay(Duration::from_secs(5));
            })
            .await;
        let backend = OpenAiBackend::new(server.base_url(), "m", "k")
            .unwrap()
            .with_idle_timeout(Duration::from_millis(100));
        let err = backend.stream_reply(&user("hi")).await.err().unwrap();
        assert!(err.to_string().contains("sent no data"), "{err}");
    }

    #[tokio::test]
    async fn streams_reply_from_server() {
        let server = MockServer::start_async().await;
        let body = format!("{}{}data: [DONE]\n\n", event("1\n00:00 --> 00:01\n"), event("Oi"));
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .body_contains("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;
        let backend = OpenAiBackend::new(server.url("/v1/"), "test-model", "sk-test").unwrap();
        let stream = backend.stream_reply(&user("hi")).await.unwrap();
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        mock.assert_async().await;
        assert_eq!(fragments.concat(), "1\n00:00 --> 00:01\nOi");
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(429).body("{\"error\":{\"message\":\"slow down\"}}");
            })
            .await;
        let backend = OpenAiBackend::new(server.base_url(), "m", "k").unwrap();
        let err = backend.stream_reply(&user("hi")).await.err().unwrap();
        assert!(matches!(
            err,
            TranslateError::Transport {
                kind: TransportKind::RateLimit,
                ..
            }
        ));
    }
}
