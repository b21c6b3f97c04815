//! Task data model and state machine.

pub mod model;
pub mod state;

pub use model::{EventKind, Task, TaskEvent};
pub use state::TaskState;
