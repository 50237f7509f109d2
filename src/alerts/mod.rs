/// Threshold alarms and their evaluation
pub mod alarm;
pub mod alarm_evaluator;

pub use alarm::{Alarm, Comparison};
pub use alarm_evaluator::{AlarmEvaluator, TriggeredAlarm};
