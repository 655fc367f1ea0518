//! 认知层：轮次主循环、文本工具调用解析、过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::{ChannelObserver, NoopObserver, TurnEvent, TurnObserver};
pub use loop_::{TurnExecutor, TurnProfile, TurnReport, TurnSettings};
pub use planner::{fallback_call, parse_handoff_marker, parse_tool_call_text, HANDOFF_MARKER};
