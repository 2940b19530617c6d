//! Scheduler: persisted once/interval/cron tasks, ticked at a configurable
//! cadence and dispatched under a concurrency cap.
//!
//! | Trigger    | Behaviour                                               |
//! |------------|----------------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant                  |
//! | `Interval` | Repeat every N minutes/hours/days, optional start_time  |
//! | `Cron`     | Five-field `m h dom mon dow` expression                 |

pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{SchedulerEngine, TaskHandler};
pub use error::{Result, SchedulerError};
pub use schedule::next_run_time;
pub use types::{ScheduledTask, TaskExecution, TaskStatus, TaskType, Trigger};
