//! Last-error side channel.
//!
//! Every failure inside the framework is returned as a [`GpuError`], and is
//! also recorded here so that code written against the "check the last
//! message" model keeps working. Only the most recent record is kept: a
//! later report silently replaces an earlier one.
//!
//! [`GpuError`]: crate::error::GpuError

use parking_lot::Mutex;
use std::fmt;

/// Severity of a recorded message.
///
/// Lower numeric levels are more important. Level 0 is an error, levels 1
/// to 4 are warnings of decreasing importance and level 5 is a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning(u8),
    Note,
}

impl Severity {
    /// Build a severity from its numeric level. Levels above 5 are notes.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Error,
            1..=4 => Self::Warning(level),
            _ => Self::Note,
        }
    }

    /// Numeric level of this severity.
    pub fn level(self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Warning(level) => level.clamp(1, 4),
            Self::Note => 5,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "Error"),
            Self::Warning(level) => write!(f, "Warning {level}"),
            Self::Note => write!(f, "Notes"),
        }
    }
}

/// A single recorded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Default)]
struct State {
    last: Option<ErrorRecord>,
    printing: bool,
    max_printed_level: u8,
}

/// Holds the most recent message reported by the framework.
#[derive(Debug, Default)]
pub struct ErrorState {
    state: Mutex<State>,
}

impl ErrorState {
    /// Create an empty error state with printing disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message, replacing any previous one.
    pub fn record(&self, message: impl Into<String>, severity: Severity) {
        let record = ErrorRecord {
            message: message.into(),
            severity,
        };

        let mut state = self.state.lock();
        if state.printing && record.severity.level() <= state.max_printed_level {
            emit(&record);
        }
        state.last = Some(record);
    }

    /// Record an error (level 0).
    pub fn error(&self, message: impl Into<String>) {
        self.record(message, Severity::Error);
    }

    /// Record a warning with the given level (1 to 4).
    pub fn warning(&self, level: u8, message: impl Into<String>) {
        self.record(message, Severity::Warning(level.clamp(1, 4)));
    }

    /// Record a note (level 5).
    pub fn note(&self, message: impl Into<String>) {
        self.record(message, Severity::Note);
    }

    /// The most recent record, if any.
    pub fn last(&self) -> Option<ErrorRecord> {
        self.state.lock().last.clone()
    }

    /// The most recent message, or an empty string.
    pub fn message(&self) -> String {
        self.state
            .lock()
            .last
            .as_ref()
            .map(|r| r.message.clone())
            .unwrap_or_default()
    }

    /// Forget the most recent record.
    pub fn clear(&self) {
        self.state.lock().last = None;
    }

    /// Enable or disable console output for new records.
    ///
    /// Records whose level is at most `max_level` are printed.
    pub fn set_printing(&self, enabled: bool, max_level: u8) {
        let mut state = self.state.lock();
        state.printing = enabled;
        state.max_printed_level = max_level;
    }

    /// Whether console output is enabled.
    pub fn is_printing(&self) -> bool {
        self.state.lock().printing
    }
}

fn emit(record: &ErrorRecord) {
    match record.severity {
        Severity::Error => tracing::error!("{} : {}", record.severity, record.message),
        Severity::Warning(_) => tracing::warn!("{} : {}", record.severity, record.message),
        Severity::Note => tracing::info!("{} : {}", record.severity, record.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_record_wins() {
        let errors = ErrorState::new();
        assert!(errors.last().is_none());
        assert_eq!(errors.message(), "");

        errors.error("Can't create Buffer");
        errors.note("2 physical device(s) found on this computer.");

        let last = errors.last().unwrap();
        assert_eq!(last.message, "2 physical device(s) found on this computer.");
        assert_eq!(last.severity, Severity::Note);
    }

    #[test]
    fn clear_forgets_record() {
        let errors = ErrorState::new();
        errors.warning(1, "Desired present mode is not supported.");
        errors.clear();
        assert!(errors.last().is_none());
    }

    #[test]
    fn severity_levels_round_trip() {
        for level in 0..=5 {
            assert_eq!(Severity::from_level(level).level(), level);
        }
        assert_eq!(Severity::from_level(9), Severity::Note);
        assert!(Severity::Error < Severity::Warning(1));
        assert!(Severity::Warning(4) < Severity::Note);
    }

    #[test]
    fn warning_level_is_clamped() {
        let errors = ErrorState::new();
        errors.warning(0, "clamped up");
        assert_eq!(errors.last().unwrap().severity, Severity::Warning(1));
        errors.warning(7, "clamped down");
        assert_eq!(errors.last().unwrap().severity, Severity::Warning(4));
    }

    #[test]
    fn printing_toggle() {
        let errors = ErrorState::new();
        assert!(!errors.is_printing());
        errors.set_printing(true, 1);
        assert!(errors.is_printing());
        // Printing does not change what is retained.
        errors.note("not printed but kept");
        assert_eq!(errors.message(), "not printed but kept");
    }
}
