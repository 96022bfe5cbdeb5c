//! CLI command implementations.
//!
//! | Module      | Commands handled                  |
//! |-------------|-----------------------------------|
//! | `run`       | `Run`                             |
//! | `runs`      | `Status`, `List`, `Approvals`     |
//! | `policy`    | `Policy check`                    |
//! | `workflows` | `Workflows`                       |
//! | `prompt`    | approval resolver for `Run`       |

pub mod policy;
pub mod prompt;
pub mod run;
pub mod runs;
pub mod workflows;

pub use policy::cmd_policy_check;
pub use run::cmd_run;
pub use runs::{cmd_approvals, cmd_list, cmd_status};
pub use workflows::cmd_workflows;
