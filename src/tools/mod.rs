pub mod call_human;
pub mod executor;
pub mod func;
pub mod http;
pub mod registry;
pub mod schema;

pub use call_human::{CallHumanArgs, CallHumanTool, CALL_HUMAN};
pub use executor::{canonical_tool_name, ToolDispatch, ToolExecutor};
pub use func::FnTool;
pub use http::HttpTool;
pub use registry::{Tool, ToolArgs, ToolCall, ToolOutput, ToolRegistry, ToolResult, ToolSchema};
pub use schema::{parameters_schema_for, parse_args};
