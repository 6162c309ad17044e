//! State module for tracking task and session lifecycles
//!
//! # Components
//!
//! - `TaskPriority` / `TaskStatus`: scheduling priority and lifecycle of queued work
//! - `SessionStatus`: lifecycle of a scraping session, including crash recovery

mod session_state;
mod task_state;

// Re-export main types
pub use session_state::SessionStatus;
pub use task_state::{TaskPriority, TaskStatus};
