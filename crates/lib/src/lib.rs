//! Bridge core library: webhook verification, event filtering, per-request tool sessions,
//! the agent invoker, and outbound dispatch, wired together by the pipeline and served
//! by the gateway.

pub mod agent;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod gateway;
pub mod integrations;
pub mod llm;
pub mod mcp;
pub mod pipeline;
pub mod tools;
pub mod verify;
