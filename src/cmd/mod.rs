//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `run`      | `Run`            |
//! | `patterns` | `Patterns`       |
//! | `agents`   | `Agents`         |

pub mod agents;
pub mod patterns;
pub mod run;

pub use agents::cmd_agents;
pub use patterns::cmd_patterns;
pub use run::cmd_run;
