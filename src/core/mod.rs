//! 核心类型：错误分类

mod error;

pub use error::AgentError;
