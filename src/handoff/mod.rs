//! Inter-phase handoff: context, instructions and expectations for the
//! next phase's agent.

pub mod builder;
pub mod project;

pub use builder::{
    CHANGED_FILES_PREVIEW, HandoffBuilder, HandoffContext, HandoffExpectations, HandoffPackage,
    HandoffRequest,
};
pub use project::{ProjectContext, detect_project};
