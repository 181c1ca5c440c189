pub mod response;
pub mod types;

pub use response::ListResponseItemsResponse;
pub use types::{
    ComputerToolCallOutputResource, FunctionToolCallOutputResource, FunctionToolCallResource,
    InputMessageResource, ItemResource, MCPApprovalResponseResource, ResponseItemList,
    ResponseItemListObjectType,
};
