//! Translation session client.
//! This module composes the prompts for a chunk, owns the conversation
//! transcript and hands it to a chat backend that streams the reply back.

use crate::error::Result;
use crate::subtitle::validate::count_units;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub mod openai;
pub mod retry;

/// Marker the model puts before the translated cues of a first-message reply.
pub const FRAME_START: &str = "<<<TRANSLATION_START>>>";
/// Marker the model puts after the translated cues of a first-message reply.
pub const FRAME_END: &str = "<<<TRANSLATION_END>>>";

/// Heading that separates the instructions from the cues in every payload.
pub const CONTENT_HEADING: &str = "Subtitles to translate:";

/// Ordered, single-pass sequence of reply fragments.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// A remote chat service able to continue a conversation.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Post the transcript, whose last entry is the new user turn, and stream
    /// the assistant's answer.
    async fn stream_reply(&self, transcript: &[ChatMessage]) -> Result<FragmentStream>;
}

#[async_trait]
impl<T: ChatBackend + ?Sized> ChatBackend for Arc<T> {
    async fn stream_reply(&self, transcript: &[ChatMessage]) -> Result<FragmentStream> {
        (**self).stream_reply(transcript).await
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Conversation state owned by exactly one job.
#[derive(Debug)]
pub struct Session {
    id: u64,
    transcript: Vec<ChatMessage>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transcript: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Commit an accepted reply so later chunks see it as context.
    pub fn record_reply(&mut self, reply: &str) {
        self.transcript.push(ChatMessage {
            role: ChatRole::Assistant,
            content: reply.to_string(),
        });
    }
}

/// What the prompts need besides the chunk itself.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub target_language: String,
    pub glossary: BTreeMap<String, String>,
}

/// Wraps a backend with session handling and prompt composition.
pub struct SessionClient<B> {
    backend: B,
}

impl<B: ChatBackend> SessionClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Send a chunk. Without a session a new one is opened and the full
    /// instructions go out; with one only a short reminder is sent.
    /// Errors are returned as-is, the session is gone in that case.
    pub async fn send(
        &self,
        session: Option<Session>,
        chunk_text: &str,
        ctx: &PromptContext,
    ) -> Result<(Session, FragmentStream)> {
        let (mut session, payload) = match session {
            Some(session) => {
                let payload = follow_up_message(chunk_text, ctx);
                (session, payload)
            }
            None => {
                let session = Session::new();
                debug!("opened session {}", session.id);
                (session, first_message(chunk_text, ctx))
            }
        };
        trace!(
            "send session={} turns={} payload_len={}",
            session.id,
            session.transcript.len(),
            payload.len()
        );
        session.transcript.push(ChatMessage {
            role: ChatRole::User,
            content: payload,
        });
        let stream = self.backend.stream_reply(&session.transcript).await?;
        Ok((session, stream))
    }

    /// Drop a session so it can never be reused.
    pub fn discard(&self, session: Session) {
        debug!(
            "discarding session {} after {} turns",
            session.id,
            session.transcript.len()
        );
    }
}

/// Full instructions used when a conversation starts.
pub fn first_message(chunk_text: &str, ctx: &PromptContext) -> String {
    let cues = count_units(chunk_text);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are a professional subtitle translator. Translate the subtitle cues below into {}.",
        ctx.target_language
    );
    out.push_str("\nRules:\n");
    let _ = writeln!(
        out,
        "- The input has exactly {cues} cues. Return exactly {cues} cues in the same order. Never merge, split, drop or add cues."
    );
    out.push_str("- Copy cue numbers and timestamp lines (the lines containing \"-->\") unchanged.\n");
    out.push_str("- Keep formatting and speaker tags such as <i>, <b>, <v Name> and {\\an8} exactly where they are and translate only the text around them.\n");
    out.push_str("- Keep one blank line between cues.\n");
    if !ctx.glossary.is_empty() {
        out.push_str("- Use these glossary translations consistently:\n");
        for (term, translation) in &ctx.glossary {
            let _ = writeln!(out, "  {term} => {translation}");
        }
    }
    let _ = writeln!(
        out,
        "- Put the translated cues between a line {FRAME_START} and a line {FRAME_END}, with nothing else in the reply."
    );
    out.push_str("- More chunks of the same file follow in this conversation. Apply the same rules to them but answer those with the cues only, without the markers.\n");
    let _ = write!(out, "\n{CONTENT_HEADING}\n{chunk_text}");
    out
}

/// Lean reminder used for later chunks of the same conversation.
pub fn follow_up_message(chunk_text: &str, ctx: &PromptContext) -> String {
    let cues = count_units(chunk_text);
    format!(
        "Next chunk, {cues} cues, into {}. Same rules: keep every cue, number, timestamp and tag; reply with the cues only.\n\n{CONTENT_HEADING}\n{chunk_text}",
        ctx.target_language
    )
}

/// Remove the protocol framing and any code fence around a reply.
pub fn strip_framing(reply: &str) -> String {
    let mut body = reply;
    if let Some(pos) = body.find(FRAME_START) {
        body = &body[pos + FRAME_START.len()..];
    }
    if let Some(pos) = body.find(FRAME_END) {
        body = &body[..pos];
    }
    let body = strip_code_fence(body.trim());
    body.replace(FRAME_START, "")
        .replace(FRAME_END, "")
        .trim()
        .to_string()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip the language tag line (```srt).
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backends shared by the retry and queue tests.

    use super::*;
    use crate::error::TranslateError;
    use crate::queue::CancelToken;
    use futures::stream::{self, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What the backend does on one call.
    pub enum Reply {
        /// Echo the chunk back, framed on the first message.
        Echo,
        /// Stream these fragments.
        Fragments(Vec<String>),
        /// Fail the call before any streaming.
        Fail(String),
        /// Stream some fragments, then error.
        BreakAfter(Vec<String>, String),
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
        cancel_on_call: Mutex<Option<(usize, CancelToken)>>,
    }

    impl ScriptedBackend {
        pub fn new(script: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        /// Trigger `token` while serving call number `call` (1-based).
        pub fn cancel_during_call(&self, call: usize, token: CancelToken) {
            *self.cancel_on_call.lock().unwrap() = Some((call, token));
        }

        pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    /// The chunk text embedded in the last user turn.
    pub fn chunk_of(transcript: &[ChatMessage]) -> String {
        let last = transcript.last().map(|m| m.content.as_str()).unwrap_or("");
        last.split_once(&format!("{CONTENT_HEADING}\n"))
            .map(|(_, chunk)| chunk.to_string())
            .unwrap_or_default()
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_reply(&self, transcript: &[ChatMessage]) -> Result<FragmentStream> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(transcript.to_vec());
                calls.len()
            };
            if let Some((at, token)) = self.cancel_on_call.lock().unwrap().as_ref() {
                if *at == call {
                    token.cancel();
                }
            }
            let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Echo);
            match reply {
                Reply::Echo => {
                    let chunk = chunk_of(transcript);
                    let text = if transcript.len() == 1 {
                        format!("{FRAME_START}\n{chunk}\n{FRAME_END}")
                    } else {
                        chunk
                    };
                    let fragments: Vec<Result<String>> = text
                        .split_inclusive('\n')
                        .map(|s| Ok(s.to_string()))
                        .collect();
                    Ok(stream::iter(fragments).boxed())
                }
                Reply::Fragments(parts) => Ok(stream::iter(parts.into_iter().map(Ok)).boxed()),
                Reply::Fail(message) => Err(TranslateError::transport(message)),
                Reply::BreakAfter(parts, message) => {
                    let mut items: Vec<Result<String>> = parts.into_iter().map(Ok).collect();
                    items.push(Err(TranslateError::transport(message)));
                    Ok(stream::iter(items).boxed())
                }
            }
        }
    }
}
