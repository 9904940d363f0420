pub use crate::openai::cancel_response::{
    CancelResponsePath, CancelResponseRequest, CancelResponseResponse,
};
pub use crate::openai::compact_response::{
    CompactResponseObjectType, CompactResponseOutputItem, CompactResponseRequest,
    CompactResponseRequestBody, CompactResponseResponse,
};
pub use crate::openai::count_tokens::request::{
    InputTokenCountRequest, InputTokenCountRequestBody,
};
pub use crate::openai::count_tokens::response::InputTokenCountResponse;
pub use crate::openai::count_tokens::types::InputTokenCount;
pub use crate::openai::create_chat_completions::request::{
    CreateChatCompletionRequest, CreateChatCompletionRequestBody, StopConfiguration,
};
pub use crate::openai::create_chat_completions::response::CreateChatCompletionResponse;
pub use crate::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
pub use crate::openai::create_response::request::{
    CreateResponseRequest, CreateResponseRequestBody,
};
pub use crate::openai::create_response::response::Response;
pub use crate::openai::create_response::stream::ResponseStreamEvent;
pub use crate::openai::create_response::types::*;
pub use crate::openai::delete_response::{
    DeleteResponseObjectType, DeleteResponsePath, DeleteResponseRequest, DeleteResponseResponse,
};
pub use crate::openai::get_model::{GetModelPath, GetModelRequest, GetModelResponse, Model};
pub use crate::openai::get_response::{
    GetResponsePath, GetResponseQuery, GetResponseRequest, GetResponseResponse, GetResponseStream,
};
pub use crate::openai::list_input_items::{
    ListInputItemsPath, ListInputItemsQuery, ListInputItemsRequest, ListInputItemsResponse,
    ListOrder,
};
pub use crate::openai::list_models::{ListModelsRequest, ListModelsResponse};
pub use crate::openai::list_response_items::{
    ComputerToolCallOutputResource, FunctionToolCallOutputResource, FunctionToolCallResource,
    InputMessageResource, ItemResource, ListResponseItemsResponse, MCPApprovalResponseResource,
    ResponseItemList, ResponseItemListObjectType,
};
