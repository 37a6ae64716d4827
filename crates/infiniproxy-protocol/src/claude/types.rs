pub use crate::claude::create_message::stream::{
    StreamContentBlockDelta, StreamEvent, StreamMessage, StreamMessageDelta, StreamUsage,
};
pub use crate::claude::create_message::types::{
    ContentBlock, ContentBlockParam, JsonObject, JsonValue, MessageContent, MessageParam,
    MessageRole, MessageType, StopReason, SystemParam, Tool, Usage,
};
pub use crate::claude::create_message::{CreateMessageRequestBody, CreateMessageResponse};
pub use crate::claude::error::{
    ErrorDetail, ErrorKind, ErrorResponse,
};
