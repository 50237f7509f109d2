pub mod refresh_scheduler;

pub use refresh_scheduler::{PollTarget, RefreshScheduler, ScheduleStart};
