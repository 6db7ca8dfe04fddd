//! 工具调用接口：后端操作经统一的 ToolInvoker 暴露给 agent

mod invoker;

pub use invoker::{
    inject_identity, strip_identity_from_schema, validate_args, RegistryCache, ToolDefinition,
    ToolInvoker, ToolOutput, IDENTITY_ARG,
};
