use std::collections::BTreeMap;

use infiniproxy_protocol::claude::create_message::stream::{
    StreamContentBlockDelta, StreamEvent, StreamMessage, StreamMessageDelta, StreamUsage,
};
use infiniproxy_protocol::claude::create_message::types::{
    ContentBlock, JsonObject, MessageRole, MessageType, StopReason, Usage,
};
use infiniproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use infiniproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionMessageToolCallChunk, CompletionUsage,
};

use super::response::{generate_message_id, generate_tool_use_id, map_finish_reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(u32),
    Tool(i64, u32),
}

/// A backend tool call that has not been fully written out yet.
#[derive(Debug, Clone, Default)]
struct PendingTool {
    id: Option<String>,
    name: Option<String>,
    /// Argument fragments not yet forwarded.
    arguments: String,
    started: bool,
}

/// Turns backend chat/completions chunks into messages stream events.
///
/// Blocks are emitted strictly one after another. The first tool call streams
/// its arguments live; fragments of any other tool call that arrive while a
/// tool block is open are held back and written out as whole blocks once the
/// open block closes.
#[derive(Debug, Clone)]
pub struct OpenAIToClaudeStreamState {
    model: String,
    message_started: bool,
    finished: bool,
    pending_finish: Option<StopReason>,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    tools: BTreeMap<i64, PendingTool>,
    reasoning_started: bool,
    response_started: bool,
    usage: Option<CompletionUsage>,
}

impl OpenAIToClaudeStreamState {
    /// `model` is echoed back to the caller in `message_start`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_started: false,
            finished: false,
            pending_finish: None,
            next_block_index: 0,
            open_block: None,
            tools: BTreeMap::new(),
            reasoning_started: false,
            response_started: false,
            usage: None,
        }
    }

    /// Last usage the backend reported, if any.
    pub fn usage(&self) -> Option<Usage> {
        self.usage.map(|usage| Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn transform_chunk(&mut self, chunk: CreateChatCompletionStreamResponse) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.ensure_started(chunk.id.as_deref(), &mut events);

        if let Some(choice) = chunk.choices.first() {
            if let Some(reasoning) = choice.delta.reasoning_content.as_deref()
                && !reasoning.is_empty()
            {
                if !self.reasoning_started {
                    self.reasoning_started = true;
                    self.emit_text("[Reasoning]\n", &mut events);
                }
                self.emit_text(reasoning, &mut events);
            }

            if let Some(content) = choice.delta.content.as_deref()
                && !content.is_empty()
            {
                if self.reasoning_started && !self.response_started {
                    self.response_started = true;
                    self.emit_text("\n\n[Response]\n", &mut events);
                }
                self.emit_text(content, &mut events);
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for call in tool_calls {
                    self.emit_tool_call(call, &mut events);
                }
            }

            if let Some(reason) = choice.finish_reason.as_ref() {
                self.close_open_block(&mut events);
                self.flush_tools(&mut events);
                self.pending_finish = Some(map_finish_reason(Some(reason)));
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
            if self.pending_finish.is_some() {
                self.emit_stop(&mut events);
            }
        }

        events
    }

    /// Close out the message once the backend stream has ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.ensure_started(None, &mut events);
        self.close_open_block(&mut events);
        self.flush_tools(&mut events);
        self.emit_stop(&mut events);
        events
    }

    /// The backend answer is being replaced by a fresh one from the start.
    ///
    /// The open block is closed and tool calls that never reached the caller
    /// are discarded. The message itself stays open, so the replacement answer
    /// continues it with new blocks.
    pub fn restart(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.close_open_block(&mut events);
        self.tools.clear();
        self.reasoning_started = false;
        self.response_started = false;
        self.pending_finish = None;
        self.usage = None;
        events
    }

    fn ensure_started(&mut self, id: Option<&str>, events: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let id = id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_message_id);
        events.push(StreamEvent::MessageStart {
            message: StreamMessage {
                id,
                r#type: MessageType::Message,
                role: MessageRole::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                usage: StreamUsage::default(),
            },
        });
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let index = match self.open_block {
            Some(OpenBlock::Text(index)) => index,
            _ => {
                self.close_open_block(events);
                self.flush_tools(events);
                let index = self.allocate_block();
                self.open_block = Some(OpenBlock::Text(index));
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: StreamContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_tool_call(
        &mut self,
        call: &ChatCompletionMessageToolCallChunk,
        events: &mut Vec<StreamEvent>,
    ) {
        if let Some(kind) = &call.r#type
            && !kind.is_function()
        {
            return;
        }

        let tool = self.tools.entry(call.index).or_default();
        if tool.id.is_none() {
            tool.id = call.id.clone().filter(|id| !id.is_empty());
        }
        if let Some(function) = &call.function {
            if tool.name.is_none() {
                tool.name = function.name.clone().filter(|name| !name.is_empty());
            }
            if let Some(arguments) = function.arguments.as_deref() {
                tool.arguments.push_str(arguments);
            }
        }

        match self.open_block {
            Some(OpenBlock::Tool(open, _)) if open == call.index => {}
            Some(OpenBlock::Tool(..)) => return,
            _ => {
                if let Some(tool) = self.tools.get_mut(&call.index)
                    && tool.started
                {
                    // its block is already closed; there is nowhere left to put this
                    tool.arguments.clear();
                    return;
                }
                self.close_open_block(events);
                let index = self.start_tool(call.index, events);
                self.open_block = Some(OpenBlock::Tool(call.index, index));
            }
        }

        if let Some(OpenBlock::Tool(_, index)) = self.open_block {
            self.forward_arguments(call.index, index, events);
        }
    }

    /// Emits `content_block_start` for a tool call and returns its block index.
    fn start_tool(&mut self, tool_index: i64, events: &mut Vec<StreamEvent>) -> u32 {
        let index = self.allocate_block();
        let tool = self.tools.entry(tool_index).or_default();
        tool.started = true;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id: tool.id.clone().unwrap_or_else(generate_tool_use_id),
                name: tool.name.clone().unwrap_or_default(),
                input: JsonObject::new(),
            },
        });
        index
    }

    fn forward_arguments(&mut self, tool_index: i64, index: u32, events: &mut Vec<StreamEvent>) {
        let Some(tool) = self.tools.get_mut(&tool_index) else {
            return;
        };
        if tool.arguments.is_empty() {
            return;
        }
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: StreamContentBlockDelta::InputJsonDelta {
                partial_json: std::mem::take(&mut tool.arguments),
            },
        });
    }

    /// Writes out every tool call that was held back, each as a whole block.
    fn flush_tools(&mut self, events: &mut Vec<StreamEvent>) {
        let waiting: Vec<i64> = self
            .tools
            .iter()
            .filter(|(_, tool)| !tool.started)
            .map(|(tool_index, _)| *tool_index)
            .collect();
        for tool_index in waiting {
            let index = self.start_tool(tool_index, events);
            self.forward_arguments(tool_index, index, events);
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn allocate_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        match self.open_block.take() {
            Some(OpenBlock::Text(index)) | Some(OpenBlock::Tool(_, index)) => {
                events.push(StreamEvent::ContentBlockStop { index });
            }
            None => {}
        }
    }

    fn emit_stop(&mut self, events: &mut Vec<StreamEvent>) {
        let usage = self
            .usage
            .map(|usage| StreamUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            })
            .unwrap_or_default();
        events.push(StreamEvent::MessageDelta {
            delta: StreamMessageDelta {
                stop_reason: Some(self.pending_finish.take().unwrap_or(StopReason::EndTurn)),
            },
            usage,
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
    }
}
