use crate::alerts::Alarm;
use crate::extract::format_float;
use log::warn;

/// An alarm that fired during evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredAlarm {
    /// Position of the alarm in its source's list
    pub index: usize,
    /// Notification text, e.g. `BTC: 101.5 >= 100.0`
    pub message: String,
}

/// Evaluates a source's alarms against its freshly extracted value
///
/// Alarms are one-shot: a triggered alarm is disabled immediately and stays
/// disabled until the user turns it back on. The caller persists the change.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlarmEvaluator;

impl AlarmEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate every enabled alarm in list order
    ///
    /// # Arguments
    ///
    /// * `source_name` - Name used in notification text
    /// * `value` - Current numeric value; `None` for text, failures or no match
    /// * `alarms` - The source's alarms, disabled in place when they fire
    ///
    /// # Returns
    ///
    /// One entry per alarm that fired, in list order
    pub fn evaluate(
        &self,
        source_name: &str,
        value: Option<f64>,
        alarms: &mut [Alarm],
    ) -> Vec<TriggeredAlarm> {
        let Some(value) = value else {
            return Vec::new();
        };

        let mut triggered = Vec::new();
        for (index, alarm) in alarms.iter_mut().enumerate() {
            if !alarm.enabled || !alarm.comparison.holds(value, alarm.threshold) {
                continue;
            }

            let message = format!(
                "{}: {} {} {}",
                source_name,
                format_float(value),
                alarm.comparison.symbol(),
                format_float(alarm.threshold)
            );
            warn!("ALARM: {}", message);
            alarm.enabled = false;
            triggered.push(TriggeredAlarm { index, message });
        }

        triggered
    }
}
