use infiniproxy_protocol::claude::create_message::response::CreateMessageResponse as ClaudeCreateMessageResponse;
use infiniproxy_protocol::claude::create_message::types::{
    ContentBlock, JsonObject, MessageRole, MessageType, StopReason, Usage,
};
use infiniproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse;
use infiniproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionFinishReason, ChatCompletionFinishReasonKnown, ChatCompletionMessageToolCall,
    ChatCompletionResponseMessage, CompletionUsage,
};
use serde_json::Value as JsonValue;

/// Convert a chat/completions response into a messages response.
///
/// `model` is what the caller sees in the reply (normally the model it asked for).
pub fn transform_response(
    response: CreateChatCompletionResponse,
    model: impl Into<String>,
) -> ClaudeCreateMessageResponse {
    let choice = response.choices.into_iter().next().unwrap_or_default();

    ClaudeCreateMessageResponse {
        id: response
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_message_id),
        r#type: MessageType::Message,
        role: MessageRole::Assistant,
        model: model.into(),
        content: map_response_message(&choice.message),
        stop_reason: map_finish_reason(choice.finish_reason.as_ref()),
        usage: response.usage.map(map_usage),
    }
}

/// Total mapping; anything unrecognised (or missing) ends the turn.
pub fn map_finish_reason(reason: Option<&ChatCompletionFinishReason>) -> StopReason {
    match reason {
        Some(ChatCompletionFinishReason::Known(known)) => match known {
            ChatCompletionFinishReasonKnown::Stop => StopReason::EndTurn,
            ChatCompletionFinishReasonKnown::Length => StopReason::MaxTokens,
            ChatCompletionFinishReasonKnown::ContentFilter => StopReason::ContentFiltered,
            ChatCompletionFinishReasonKnown::ToolCalls
            | ChatCompletionFinishReasonKnown::FunctionCall => StopReason::ToolUse,
        },
        Some(ChatCompletionFinishReason::Custom(_)) | None => StopReason::EndTurn,
    }
}

pub(crate) fn generate_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..24])
}

pub(crate) fn generate_tool_use_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("toolu_{}", &hex[..24])
}

pub(crate) fn with_reasoning(reasoning: &str, content: &str) -> String {
    format!("[Reasoning]\n{reasoning}\n\n[Response]\n{content}")
}

/// Decode a tool-call argument string. Malformed or non-object JSON yields `{}`.
pub(crate) fn parse_tool_arguments(arguments: Option<&str>) -> JsonObject {
    let Some(arguments) = arguments.filter(|raw| !raw.trim().is_empty()) else {
        return JsonObject::new();
    };
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(JsonValue::Object(map)) => map,
        _ => JsonObject::new(),
    }
}

fn map_response_message(message: &ChatCompletionResponseMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    let content = message.content.as_deref().unwrap_or_default();
    let text = match message.reasoning_content.as_deref() {
        Some(reasoning) if !reasoning.is_empty() => with_reasoning(reasoning, content),
        _ => content.to_string(),
    };
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }

    if let Some(tool_calls) = &message.tool_calls {
        blocks.extend(tool_calls.iter().filter_map(map_tool_call));
    }

    blocks
}

fn map_tool_call(call: &ChatCompletionMessageToolCall) -> Option<ContentBlock> {
    if let Some(kind) = &call.r#type
        && !kind.is_function()
    {
        return None;
    }
    let function = call.function.clone().unwrap_or_default();
    Some(ContentBlock::ToolUse {
        id: call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_tool_use_id),
        name: function.name.unwrap_or_default(),
        input: parse_tool_arguments(function.arguments.as_deref()),
    })
}

fn map_usage(usage: CompletionUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(value: JsonValue) -> CreateChatCompletionResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn finish_reason_table_is_total() {
        let cases = [
            ("stop", StopReason::EndTurn),
            ("length", StopReason::MaxTokens),
            ("content_filter", StopReason::ContentFiltered),
            ("tool_calls", StopReason::ToolUse),
            ("function_call", StopReason::ToolUse),
            ("eos", StopReason::EndTurn),
        ];
        for (raw, expected) in cases {
            let reason: ChatCompletionFinishReason = serde_json::from_value(json!(raw)).unwrap();
            assert_eq!(map_finish_reason(Some(&reason)), expected, "{raw}");
        }
        assert_eq!(map_finish_reason(None), StopReason::EndTurn);
    }

    #[test]
    fn length_without_tool_calls_is_single_text_block() {
        let out = transform_response(
            response(json!({
                "id": "chatcmpl-1",
                "model": "glm-4.6",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "truncated"},
                    "finish_reason": "length"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 50, "total_tokens": 62}
            })),
            "claude-x",
        );
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({
                "id": "chatcmpl-1",
                "type": "message",
                "role": "assistant",
                "model": "claude-x",
                "content": [{"type": "text", "text": "truncated"}],
                "stop_reason": "max_tokens",
                "usage": {"input_tokens": 12, "output_tokens": 50}
            })
        );
    }

    #[test]
    fn missing_usage_is_omitted_not_zeroed() {
        let out = transform_response(
            response(json!({
                "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}]
            })),
            "m",
        );
        let value = serde_json::to_value(&out).unwrap();
        assert!(value.get("usage").is_none());
        assert!(out.id.starts_with("msg_"));
        assert_eq!(out.id.len(), "msg_".len() + 24);
    }

    #[test]
    fn reasoning_is_prefixed_as_two_sections() {
        let out = transform_response(
            response(json!({
                "choices": [{
                    "message": {"content": "4", "reasoning_content": "2 plus 2"},
                    "finish_reason": "stop"
                }]
            })),
            "m",
        );
        assert_eq!(
            out.content,
            vec![ContentBlock::Text {
                text: "[Reasoning]\n2 plus 2\n\n[Response]\n4".to_string()
            }]
        );
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let out = transform_response(
            response(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [
                            {"id": "call_1", "type": "function",
                             "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}},
                            {"id": "call_2", "type": "function",
                             "function": {"name": "broken", "arguments": "{not json"}}
                        ]
                    },
                    "finish_reason": "tool_calls"
                }]
            })),
            "m",
        );
        assert_eq!(out.stop_reason, StopReason::ToolUse);
        assert_eq!(
            serde_json::to_value(&out.content).unwrap(),
            json!([
                {"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {"city": "Paris"}},
                {"type": "tool_use", "id": "call_2", "name": "broken", "input": {}}
            ])
        );
    }

    #[test]
    fn empty_choices_degrade_to_empty_content() {
        let out = transform_response(response(json!({"choices": []})), "m");
        assert!(out.content.is_empty());
        assert_eq!(out.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn argument_parsing_degrades_to_empty_object() {
        assert!(parse_tool_arguments(None).is_empty());
        assert!(parse_tool_arguments(Some("")).is_empty());
        assert!(parse_tool_arguments(Some("[1,2]")).is_empty());
        assert_eq!(
            parse_tool_arguments(Some("{\"a\":1}")).get("a"),
            Some(&json!(1))
        );
    }
}
