//! Approval subsystem: durable human-in-the-loop decisions.
//!
//! - [`store`]: append-only approval records, in memory and as per-run JSONL
//! - [`gate`]: answers `prompt` policy decisions, reusing remembered ones
//! - [`exec`]: the direct shell-approval path with rate limiting
//! - [`rate_limit`] and [`audit`]: owned limiter and diagnostics ring

pub mod audit;
pub mod exec;
pub mod gate;
pub mod rate_limit;
pub mod store;
pub mod types;

pub use audit::{AuditEntry, AuditKind, AuditRing, DEFAULT_AUDIT_CAPACITY};
pub use exec::{CreateOutcome, ExecApprovalManager, ExecApprovalRecord, ExecDecision, ExecRequest};
pub use gate::{
    ApprovalGate, ApprovalPrompter, ExecApprovalPrompter, GateResult, PromptResponse,
    StaticPrompter,
};
pub use rate_limit::{MAX_BACKOFF_MS, RateLimitConfig, RateLimitVerdict, RateLimiter};
pub use store::{
    APPROVALS_FILE, ApprovalStore, CompositeApprovalStore, FileApprovalStore, MemoryApprovalStore,
};
pub use types::{
    ApprovalDecision, ApprovalOutcome, ApprovalRecord, ApprovalRequest, RememberScope,
};
