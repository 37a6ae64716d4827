use infiniproxy_protocol::claude::create_message::request::CreateMessageRequestBody as ClaudeCreateMessageRequestBody;
use infiniproxy_protocol::claude::create_message::types::{
    ContentBlockParam as ClaudeContentBlockParam, MessageContent as ClaudeMessageContent,
    MessageParam as ClaudeMessageParam, MessageRole as ClaudeMessageRole,
    SystemParam as ClaudeSystemParam, Tool as ClaudeTool,
};
use infiniproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequestBody as OpenAIChatCompletionRequestBody;
use infiniproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionRequestMessage, ChatCompletionRole, ChatCompletionToolDefinition,
    ChatCompletionToolType, FunctionObject,
};
use serde_json::Value as JsonValue;

use crate::config::TranslatorConfig;

/// Convert a messages request into a chat/completions request.
///
/// `model` is filled with the configured default; model resolution rewrites it
/// before the request leaves the gateway.
pub fn transform_request(
    request: ClaudeCreateMessageRequestBody,
    config: &TranslatorConfig,
) -> OpenAIChatCompletionRequestBody {
    let mut messages = Vec::new();
    if let Some(system) = request.system.as_ref() {
        messages.push(map_system_message(system));
    }
    for message in &request.messages {
        messages.extend(map_message(message));
    }

    OpenAIChatCompletionRequestBody {
        model: config.default_model.clone(),
        messages,
        tools: request.tools.as_deref().map(transform_tools),
        max_tokens: Some(config.clamp_max_tokens(request.max_tokens)),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream.unwrap_or(false),
    }
}

/// Structural rename of tool declarations; schemas are not inspected.
pub fn transform_tools(tools: &[ClaudeTool]) -> Vec<ChatCompletionToolDefinition> {
    tools
        .iter()
        .map(|tool| ChatCompletionToolDefinition {
            r#type: ChatCompletionToolType::function(),
            function: FunctionObject {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters: if tool.input_schema.is_null() {
                    JsonValue::Object(Default::default())
                } else {
                    tool.input_schema.clone()
                },
            },
        })
        .collect()
}

fn map_system_message(system: &ClaudeSystemParam) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::new(ChatCompletionRole::System, system.flatten_text())
}

fn map_role(role: ClaudeMessageRole) -> ChatCompletionRole {
    match role {
        ClaudeMessageRole::User => ChatCompletionRole::User,
        ClaudeMessageRole::Assistant => ChatCompletionRole::Assistant,
    }
}

fn map_message(message: &ClaudeMessageParam) -> Vec<ChatCompletionRequestMessage> {
    let role = map_role(message.role);
    let blocks = message.content.blocks();
    if !blocks.iter().any(ClaudeContentBlockParam::is_tool_result) {
        return vec![ChatCompletionRequestMessage::new(
            role,
            message.content.flatten_text(),
        )];
    }

    // One tool turn per result, then any sibling text as a trailing user turn.
    let mut output = Vec::new();
    for block in blocks {
        if let ClaudeContentBlockParam::ToolResult {
            tool_use_id,
            content,
            ..
        } = block
        {
            let text = content
                .as_ref()
                .map(ClaudeMessageContent::flatten_text)
                .unwrap_or_default();
            output.push(ChatCompletionRequestMessage::tool(tool_use_id.clone(), text));
        }
    }

    let sibling_text = blocks
        .iter()
        .filter_map(ClaudeContentBlockParam::as_text)
        .collect::<Vec<_>>()
        .join("\n");
    if !sibling_text.trim().is_empty() {
        output.push(ChatCompletionRequestMessage::new(
            ChatCompletionRole::User,
            sibling_text,
        ));
    }

    output
}
