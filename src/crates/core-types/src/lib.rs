//! Steward shared low-level DTOs
//!
//! Session, message and part shapes persisted by the core and published on
//! the event bus. The crate stays free of runtime dependencies so storage
//! adapters and transports can share the same definitions.

pub mod message;
pub mod part;
pub mod session;
pub mod status;

pub use message::{
    ApiErrorData, AssistantMessage, CacheUsage, FileDiff, MessageError, MessageInfo, MessagePath,
    MessageTime, MessageWithParts, ModelRef, TokenUsage, UserMessage, UserSummary,
};
pub use part::{
    FileAttachment, Part, PartData, PartTime, ToolCompletion, ToolState, ToolStateError, ToolTime,
};
pub use session::{PermissionAction, PermissionRule, Session, SessionRevert, SessionTime};
pub use status::SessionStatus;
