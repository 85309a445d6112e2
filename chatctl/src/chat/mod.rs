//! The chat request pipeline.
//!
//! A request travels through an ordered chain of [`ChatMiddleware`] stages before reaching the
//! model. The stages this crate ships:
//!
//! | Stage | Order | Effect |
//! |-------|-------|--------|
//! | [`CheckUsage`](crate::quota::CheckUsage) | -1000 | Rejects requests from users over their monthly quota |
//! | [`RecordUsage`] | -500 | Adds the reported tokens to the usage ledger |

pub mod context;
pub mod pipeline;
pub mod recording;

pub use context::{ChatContext, ChatMessage, ChatRequest, ChatResponse, ChatRole, ChatUser, TokenUsage};
pub use pipeline::{ChatHandler, ChatMiddleware, ChatPipeline, ChatPipelineBuilder, Next};
pub use recording::RecordUsage;
