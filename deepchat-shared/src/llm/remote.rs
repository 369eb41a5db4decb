//! OpenAI-compatible remote model client.
//!
//! Speaks the `/chat/completions` wire format with `stream: true`, re-chunks
//! tagged reasoning blocks out of the text stream when configured, and runs
//! a bounded tool-invocation loop between streaming rounds.

use std::{collections::BTreeMap, env, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{io::AsyncBufReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::{
    config::server::ProviderSection,
    llm::{
        errors::{LlmError, LlmResult},
        traits::{CompletionStream, LanguageModel, ToolDefinition, ToolExecutor},
        types::{CompletionRequest, FinishReason, ModelSpec, StreamChunk, TokenUsage},
    },
    models::chat::MessageRole,
};

#[derive(Clone)]
pub struct RemoteModel {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    spec: ModelSpec,
    timeout: Duration,
    tool_round_limit: u32,
    tools: Option<Arc<dyn ToolExecutor>>,
}

impl std::fmt::Debug for RemoteModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteModel")
            .field("base_url", &self.base_url)
            .field("model", &self.spec.model)
            .finish_non_exhaustive()
    }
}

impl RemoteModel {
    #[must_use]
    pub fn new(base_url: impl Into<String>, spec: ModelSpec) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            spec,
            timeout: Duration::from_secs(60),
            tool_round_limit: 5,
            tools: None,
        }
    }

    /// Builds the chat-slot client from provider configuration. The API key
    /// is read from the environment variable named in the config.
    ///
    /// # Errors
    /// Returns [`LlmError::Credentials`] if the key variable is unset.
    pub fn for_chat(section: &ProviderSection) -> LlmResult<Self> {
        Self::for_slot(section, section.chat.clone())
    }

    /// Builds the title-slot client from provider configuration.
    ///
    /// # Errors
    /// Returns [`LlmError::Credentials`] if the key variable is unset.
    pub fn for_title(section: &ProviderSection) -> LlmResult<Self> {
        Self::for_slot(section, section.title.clone())
    }

    fn for_slot(section: &ProviderSection, spec: ModelSpec) -> LlmResult<Self> {
        let api_key = env::var(&section.api_key_env)
            .map_err(|_| LlmError::Credentials(section.api_key_env.clone()))?;

        Ok(Self::new(section.base_url.clone(), spec)
            .with_api_key(api_key)
            .with_timeout(Duration::from_secs(section.request_timeout_seconds))
            .with_tool_round_limit(section.tool_round_limit))
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tool_round_limit(mut self, limit: u32) -> Self {
        self.tool_round_limit = limit;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    fn extractor(&self) -> Option<ReasoningExtractor> {
        if !self.spec.reasoning_extraction {
            return None;
        }
        self.spec
            .reasoning_tag
            .as_deref()
            .map(ReasoningExtractor::new)
    }

    fn wire_messages(request: &CompletionRequest) -> Vec<WireMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(WireMessage::plain(MessageRole::System, system.clone()));
        }
        for message in &request.messages {
            messages.push(WireMessage::plain(message.role, message.content.clone()));
        }
        messages
    }

    async fn open_round(
        &self,
        messages: &[WireMessage],
        tools: &[WireTool],
        stream: bool,
        request: &CompletionRequest,
    ) -> LlmResult<reqwest::Response> {
        let body = ChatCompletionBody {
            model: &self.spec.model,
            messages,
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .json(&body);

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }
        Ok(response)
    }

    async fn drive(
        self,
        first: reqwest::Response,
        mut messages: Vec<WireMessage>,
        tools: Vec<WireTool>,
        request: CompletionRequest,
        tx: mpsc::Sender<LlmResult<StreamChunk>>,
    ) {
        let budget = request.tool_budget.min(self.tool_round_limit);
        let mut extractor = self.extractor();
        let mut finish = FinishReason::Stop;
        let mut usage = None;
        let mut rounds: u32 = 0;
        let mut response = first;

        loop {
            let outcome = match consume_round(response, &mut extractor, &tx).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            if outcome.aborted {
                debug!("completion stream receiver dropped; abandoning round");
                return;
            }
            if let Some(value) = outcome.usage {
                usage = Some(value);
            }
            if let Some(reason) = outcome.finish_reason {
                finish = reason;
            }

            if outcome.tool_calls.is_empty() {
                break;
            }

            let Some(executor) = self.tools.clone() else {
                finish = FinishReason::ToolCalls;
                break;
            };

            if rounds >= budget {
                warn!(budget, "tool round budget exhausted; ending turn");
                finish = FinishReason::ToolCalls;
                break;
            }
            rounds += 1;

            messages.push(WireMessage::assistant_with_calls(
                outcome.text,
                &outcome.tool_calls,
            ));
            for call in &outcome.tool_calls {
                let arguments = serde_json::from_str::<Value>(&call.arguments).ok();
                match executor.call_tool(&call.name, arguments).await {
                    Ok(result) => {
                        messages.push(WireMessage::tool_result(call.id.clone(), result.to_string()));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }

            response = match self.open_round(&messages, &tools, true, &request).await {
                Ok(response) => response,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
        }

        if let Some(extractor) = extractor {
            let (text, reasoning) = extractor.finish();
            if !text.is_empty() && tx.send(Ok(StreamChunk::text(text))).await.is_err() {
                return;
            }
            if !reasoning.is_empty()
                && tx.send(Ok(StreamChunk::reasoning(reasoning))).await.is_err()
            {
                return;
            }
        }

        let _ = tx.send(Ok(StreamChunk::finished(finish, usage))).await;
    }
}

#[async_trait]
impl LanguageModel for RemoteModel {
    async fn stream(&self, request: CompletionRequest) -> LlmResult<CompletionStream> {
        let messages = Self::wire_messages(&request);
        let tools = match &self.tools {
            Some(executor) => executor
                .list_tools()
                .await
                .into_iter()
                .map(WireTool::from)
                .collect(),
            None => Vec::new(),
        };

        // The first round is opened here so connection and auth failures
        // surface before any response bytes are committed.
        let response = self.open_round(&messages, &tools, true, &request).await?;

        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move { this.drive(response, messages, tools, request, tx).await });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<String> {
        let messages = Self::wire_messages(&request);
        let response = self.open_round(&messages, &[], false, &request).await?;

        let payload: CompletionPayload = response.json().await?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Protocol("completion response had no content".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.spec.model
    }
}

struct RoundOutcome {
    text: String,
    tool_calls: Vec<AccumulatedCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    aborted: bool,
}

#[derive(Debug, Clone, Default)]
struct AccumulatedCall {
    id: String,
    name: String,
    arguments: String,
}

async fn consume_round(
    response: reqwest::Response,
    extractor: &mut Option<ReasoningExtractor>,
    tx: &mpsc::Sender<LlmResult<StreamChunk>>,
) -> LlmResult<RoundOutcome> {
    let stream = response
        .bytes_stream()
        .map_err(|err| std::io::Error::other(err.to_string()));
    let mut lines = StreamReader::new(stream).lines();

    let mut outcome = RoundOutcome {
        text: String::new(),
        tool_calls: Vec::new(),
        finish_reason: None,
        usage: None,
        aborted: false,
    };
    let mut calls: BTreeMap<usize, AccumulatedCall> = BTreeMap::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => return Err(LlmError::Protocol(err.to_string())),
        };

        let Some(data) = parse_data_line(&line) else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }

        let payload: StreamPayload = serde_json::from_str(data)
            .map_err(|err| LlmError::Protocol(format!("{err}: {data}")))?;

        if let Some(wire_usage) = payload.usage {
            outcome.usage = Some(TokenUsage {
                prompt_tokens: wire_usage.prompt_tokens,
                completion_tokens: wire_usage.completion_tokens,
                total_tokens: wire_usage.total_tokens,
            });
        }

        let Some(choice) = payload.choices.into_iter().next() else {
            continue;
        };

        if let Some(reason) = choice.finish_reason.as_deref() {
            outcome.finish_reason = Some(FinishReason::from_provider(reason));
        }

        for delta in choice.delta.tool_calls {
            let entry = calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                entry.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    entry.name = name;
                }
                if let Some(arguments) = function.arguments {
                    entry.arguments.push_str(&arguments);
                }
            }
        }

        if let Some(reasoning) = choice.delta.reasoning_content {
            if !reasoning.is_empty()
                && tx.send(Ok(StreamChunk::reasoning(reasoning))).await.is_err()
            {
                outcome.aborted = true;
                return Ok(outcome);
            }
        }

        let Some(content) = choice.delta.content else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        outcome.text.push_str(&content);

        let (text, reasoning) = match extractor {
            Some(extractor) => extractor.push(&content),
            None => (content, String::new()),
        };

        if !text.is_empty() && tx.send(Ok(StreamChunk::text(text))).await.is_err() {
            outcome.aborted = true;
            return Ok(outcome);
        }
        if !reasoning.is_empty()
            && tx.send(Ok(StreamChunk::reasoning(reasoning))).await.is_err()
        {
            outcome.aborted = true;
            return Ok(outcome);
        }
    }

    outcome.tool_calls = calls.into_values().collect();
    Ok(outcome)
}

fn parse_data_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))
        .map(str::trim)
}

/// Splits a text stream into visible text and tag-delimited reasoning,
/// tolerating tags broken across delta boundaries.
#[derive(Debug)]
struct ReasoningExtractor {
    open_tag: String,
    close_tag: String,
    inside: bool,
    buf: String,
}

impl ReasoningExtractor {
    fn new(tag: &str) -> Self {
        Self {
            open_tag: format!("<{tag}>"),
            close_tag: format!("</{tag}>"),
            inside: false,
            buf: String::new(),
        }
    }

    fn push(&mut self, delta: &str) -> (String, String) {
        self.buf.push_str(delta);
        let mut text = String::new();
        let mut reasoning = String::new();

        loop {
            let tag = if self.inside {
                &self.close_tag
            } else {
                &self.open_tag
            };
            let sink = if self.inside {
                &mut reasoning
            } else {
                &mut text
            };

            if let Some(idx) = self.buf.find(tag.as_str()) {
                sink.push_str(&self.buf[..idx]);
                let consumed = idx + tag.len();
                self.buf.drain(..consumed);
                self.inside = !self.inside;
            } else {
                // Hold back any suffix that could be the start of the tag.
                let keep = held_back_len(&self.buf, tag);
                let emit = self.buf.len() - keep;
                sink.push_str(&self.buf[..emit]);
                self.buf.drain(..emit);
                break;
            }
        }

        (text, reasoning)
    }

    fn finish(self) -> (String, String) {
        if self.inside {
            (String::new(), self.buf)
        } else {
            (self.buf, String::new())
        }
    }
}

fn held_back_len(buf: &str, tag: &str) -> usize {
    let max = buf.len().min(tag.len().saturating_sub(1));
    for len in (1..=max).rev() {
        if buf.is_char_boundary(buf.len() - len)
            && tag.as_bytes().starts_with(&buf.as_bytes()[buf.len() - len..])
        {
            return len;
        }
    }
    0
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [WireTool],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    tool_calls: Vec<WireToolCall>,
}

impl WireMessage {
    fn plain(role: MessageRole, content: String) -> Self {
        Self {
            role: role.as_str().to_string(),
            content,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    fn assistant_with_calls(content: String, calls: &[AccumulatedCall]) -> Self {
        Self {
            role: MessageRole::Assistant.as_str().to_string(),
            content,
            tool_call_id: None,
            tool_calls: calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
        }
    }

    fn tool_result(tool_call_id: String, content: String) -> Self {
        Self {
            role: MessageRole::Tool.as_str().to_string(),
            content,
            tool_call_id: Some(tool_call_id),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolSpec,
}

#[derive(Debug, Serialize)]
struct WireToolSpec {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

impl From<ToolDefinition> for WireTool {
    fn from(definition: ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: WireToolSpec {
                name: definition.name,
                description: definition.description,
                parameters: definition.parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionPayload {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_lines_are_recognized() {
        assert_eq!(parse_data_line("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(parse_data_line("data:[DONE]"), Some("[DONE]"));
        assert_eq!(parse_data_line(": keep-alive"), None);
        assert_eq!(parse_data_line(""), None);
    }

    #[test]
    fn extractor_splits_reasoning_from_text() {
        let mut extractor = ReasoningExtractor::new("think");
        let (text, reasoning) = extractor.push("<think>planning</think>answer");
        assert_eq!(text, "answer");
        assert_eq!(reasoning, "planning");
    }

    #[test]
    fn extractor_handles_tags_split_across_deltas() {
        let mut extractor = ReasoningExtractor::new("think");
        let mut text = String::new();
        let mut reasoning = String::new();
        for delta in ["<th", "ink>deep ", "thought</th", "ink>the reply"] {
            let (t, r) = extractor.push(delta);
            text.push_str(&t);
            reasoning.push_str(&r);
        }
        let (t, r) = extractor.finish();
        text.push_str(&t);
        reasoning.push_str(&r);

        assert_eq!(text, "the reply");
        assert_eq!(reasoning, "deep thought");
    }

    #[test]
    fn extractor_passes_plain_text_through() {
        let mut extractor = ReasoningExtractor::new("think");
        let (text, reasoning) = extractor.push("no tags here");
        // "here" could not start a tag, so nothing is held back.
        assert_eq!(text, "no tags here");
        assert_eq!(reasoning, "");
    }

    #[test]
    fn extractor_holds_back_possible_tag_prefix() {
        let mut extractor = ReasoningExtractor::new("think");
        let (text, _) = extractor.push("answer <");
        assert_eq!(text, "answer ");
        let (text, _) = extractor.push("= b");
        assert_eq!(text, "<= b");
    }

    #[test]
    fn unterminated_reasoning_flushes_as_reasoning() {
        let mut extractor = ReasoningExtractor::new("think");
        let _ = extractor.push("<think>half a thought");
        let (text, reasoning) = extractor.finish();
        assert_eq!(text, "");
        assert_eq!(reasoning, "half a thought");
    }

    #[test]
    fn request_body_omits_empty_tool_fields() {
        let messages = vec![WireMessage::plain(MessageRole::User, "hi".into())];
        let body = ChatCompletionBody {
            model: "pplx-70b-online",
            messages: &messages,
            stream: true,
            max_tokens: None,
            temperature: None,
            tools: &[],
            tool_choice: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert!(value.get("max_tokens").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn stream_payload_parses_tool_call_deltas() {
        let payload: StreamPayload = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"lookup","arguments":"{\"q\":"}}]},"finish_reason":null}],"usage":null}"#,
        )
        .unwrap();
        let delta = &payload.choices[0].delta.tool_calls[0];
        assert_eq!(delta.index, 0);
        assert_eq!(delta.id.as_deref(), Some("c1"));
    }
}
