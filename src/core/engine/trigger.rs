use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger is empty")]
    Empty,
    #[error("expected HH:MM, got '{0}'")]
    BadTime(String),
    #[error("hour {0} out of range")]
    Hour(u32),
    #[error("minute {0} out of range")]
    Minute(u32),
    #[error("cron expression needs 5 or 6 fields, got {0}")]
    FieldCount(usize),
}

/// Rewrites `HH:MM` to `"<minute> <hour> * * *"`. Anything containing
/// whitespace is taken as a cron expression and returned trimmed.
pub fn to_cron(trigger: &str) -> Result<String, TriggerError> {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return Err(TriggerError::Empty);
    }
    if trigger.contains(char::is_whitespace) {
        return Ok(trigger.to_string());
    }

    let (hour, minute) = trigger
        .split_once(':')
        .ok_or_else(|| TriggerError::BadTime(trigger.to_string()))?;
    let parse = |s: &str| {
        if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TriggerError::BadTime(trigger.to_string()));
        }
        s.parse::<u32>()
            .map_err(|_| TriggerError::BadTime(trigger.to_string()))
    };
    let (hour, minute) = (parse(hour)?, parse(minute)?);
    if hour > 23 {
        return Err(TriggerError::Hour(hour));
    }
    if minute > 59 {
        return Err(TriggerError::Minute(minute));
    }
    Ok(format!("{minute} {hour} * * *"))
}

/// The scheduler wants a leading seconds field; 5-field expressions fire at
/// second zero.
pub fn with_seconds(cron: &str) -> Result<String, TriggerError> {
    let fields = cron.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", cron.split_whitespace().collect::<Vec<_>>().join(" "))),
        6 | 7 => Ok(cron.split_whitespace().collect::<Vec<_>>().join(" ")),
        n => Err(TriggerError::FieldCount(n)),
    }
}
