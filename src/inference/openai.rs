use std::collections::HashMap;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::InferenceError;
use crate::provider::{CompletionProvider, ResponseStream};
use crate::types::{
    new_id, ChatMessage, ChatOptions, ChatResponse, ContentPart, ResponseUpdate, Role,
    StopReason, ToolCall, Usage,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible provider. Works with vLLM, LM Studio, OpenRouter,
/// or any server that implements the `/v1/chat/completions` endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: DEFAULT_MODEL.into(),
        }
    }

    /// Set an API key (required for OpenAI, OpenRouter, etc.).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Model used when the request options don't name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Convert tool definitions to OpenAI function-calling format. Accepts
    /// either `input_schema` or `parameters` for the argument schema.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let name = tool["name"].as_str()?;
                let description = tool.get("description").cloned().unwrap_or(Value::Null);
                let parameters = tool
                    .get("input_schema")
                    .or_else(|| tool.get("parameters"))
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));

                Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": description,
                        "parameters": parameters,
                    }
                }))
            })
            .collect()
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::Developer => "developer",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut out = json!({ "role": role, "content": msg.content });

                if !msg.parts.is_empty() {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(json!({"type": "text", "text": msg.content}));
                    }
                    for part in &msg.parts {
                        parts.push(match part {
                            ContentPart::Text { text } => json!({"type": "text", "text": text}),
                            ContentPart::Image { media_type, data } => json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{media_type};base64,{data}") },
                            }),
                        });
                    }
                    out["content"] = Value::Array(parts);
                }

                if !msg.tool_calls.is_empty() {
                    out["tool_calls"] = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.arguments },
                            })
                        })
                        .collect();
                }
                if let Some(ref id) = msg.tool_call_id {
                    out["tool_call_id"] = json!(id);
                }
                out
            })
            .collect()
    }

    fn body(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> Value {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": Self::convert_messages(messages),
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if !options.tools.is_empty() {
            body["tools"] = Value::Array(Self::convert_tools(&options.tools));
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        debug!(model = %model, messages = messages.len(), stream, "openai inference request");
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, InferenceError> {
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::ApiError { status, body: text });
        }
        Ok(resp)
    }
}

fn stop_reason(finish_reason: &str) -> StopReason {
    match finish_reason {
        "stop" => StopReason::EndTurn,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        other => {
            debug!(finish_reason = %other, "unknown finish_reason, treating as EndTurn");
            StopReason::EndTurn
        }
    }
}

fn usage_of(value: &Value) -> Option<Usage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    Some(Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

/// Folds streamed chunks into updates. Tool-call deltas are keyed by index;
/// only the first delta for an index carries the id and name.
#[derive(Default)]
struct ChunkDecoder {
    call_ids: HashMap<u64, String>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl ChunkDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<ResponseUpdate>, InferenceError> {
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }
        let chunk: Value =
            serde_json::from_str(data).map_err(|e| InferenceError::Parse(e.to_string()))?;
        let mut updates = Vec::new();

        if let Some(choice) = chunk["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
                updates.push(ResponseUpdate::Text { delta: text.to_string() });
            }
            for tc in delta["tool_calls"].as_array().into_iter().flatten() {
                let index = tc["index"].as_u64().unwrap_or(0);
                if !self.call_ids.contains_key(&index) {
                    // Some backends never send an id; the call still needs one.
                    let id = match tc["id"].as_str().filter(|id| !id.is_empty()) {
                        Some(id) => id.to_string(),
                        None => {
                            let id = new_id("call");
                            warn!(index, tool_call_id = %id, "tool call without an id, generated one");
                            id
                        }
                    };
                    self.call_ids.insert(index, id.clone());
                    updates.push(ResponseUpdate::ToolCallStart {
                        id,
                        name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    });
                }
                let args = tc["function"]["arguments"].as_str().unwrap_or("");
                if let Some(id) = self.call_ids.get(&index).filter(|_| !args.is_empty()) {
                    updates.push(ResponseUpdate::ToolCallArgs {
                        id: id.clone(),
                        delta: args.to_string(),
                    });
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.stop_reason = Some(stop_reason(reason));
            }
        }

        if let Some(usage) = usage_of(&chunk) {
            updates.push(ResponseUpdate::Usage(usage));
        }
        Ok(updates)
    }

    fn finish(&mut self) -> Vec<ResponseUpdate> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let stop_reason = self.stop_reason.unwrap_or(if self.call_ids.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        });
        vec![ResponseUpdate::Finished { stop_reason }]
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        ctx.check_cancelled()?;
        let body = self.body(&messages, options, false);
        let text = self
            .send(&body)
            .await?
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;
        let choice = &parsed["choices"][0];
        let message = &choice["message"];

        let tool_calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|tc| {
                let id = match tc["id"].as_str().filter(|id| !id.is_empty()) {
                    Some(id) => id.to_string(),
                    None => new_id("call"),
                };
                ToolCall::new(
                    id,
                    tc["function"]["name"].as_str().unwrap_or(""),
                    tc["function"]["arguments"].as_str().unwrap_or("{}"),
                )
            })
            .collect();

        Ok(ChatResponse {
            text: message["content"].as_str().unwrap_or("").to_string(),
            stop_reason: stop_reason(choice["finish_reason"].as_str().unwrap_or("stop")),
            usage: usage_of(&parsed).unwrap_or_default(),
            tool_calls,
            history: Vec::new(),
        })
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        ctx.check_cancelled()?;
        let body = self.body(&messages, options, true);
        let mut events = self.send(&body).await?.bytes_stream().eventsource();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut decoder = ChunkDecoder::default();
            while let Some(event) = events.next().await {
                let updates = match event {
                    Ok(event) => decoder.decode(&event.data),
                    Err(e) => Err(InferenceError::Request(e.to_string())),
                };
                match updates {
                    Ok(updates) => {
                        for update in updates {
                            if tx.send(Ok(update)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
                if decoder.finished {
                    return;
                }
            }
            for update in decoder.finish() {
                let _ = tx.send(Ok(update)).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
