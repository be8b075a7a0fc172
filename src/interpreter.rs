//! Output Stream Interpreter
//!
//! Turns free-form downloader output into structured events. The caller owns the
//! last known track identifier; re-announcing the same track is a no-op.

use std::borrow::Cow;

use regex::Regex;

use crate::config::ErrorDictionary;
use crate::errors::SupervisorError;
use crate::services::ServiceProfile;

/// CSI sequences, OSC strings and two-byte escapes.
const ANSI_PATTERN: &str = r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]";

/// One classified consequence of a unit of output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    TrackIdentified(String),
    ProgressUpdate(f64),
    /// User-facing message of a recognized or unrecognized runtime error.
    ErrorDetected(String),
    Unclassified,
}

pub struct OutputInterpreter<'a> {
    profile: &'a ServiceProfile,
    dictionary: &'a ErrorDictionary,
    ansi_re: Option<Regex>,
}

impl<'a> OutputInterpreter<'a> {
    pub fn new(profile: &'a ServiceProfile, dictionary: &'a ErrorDictionary) -> Self {
        Self {
            profile,
            dictionary,
            ansi_re: Regex::new(ANSI_PATTERN).ok(),
        }
    }

    pub fn strip_ansi<'t>(&self, text: &'t str) -> Cow<'t, str> {
        match self.ansi_re {
            Some(ref re) => re.replace_all(text, ""),
            None => Cow::Borrowed(text),
        }
    }

    /// Classify one complete stdout line.
    ///
    /// An error-dictionary hit short-circuits. Otherwise a new track identifier and a
    /// progress value may both come from the same line, in that order.
    pub fn classify_line(&self, line: &str, known_track_id: Option<&str>) -> Vec<OutputEvent> {
        let text = self.strip_ansi(line);

        if let Some(message) = self.dictionary.lookup(&text) {
            let err = SupervisorError::RecognizedRuntimeError(message.to_string());
            return vec![OutputEvent::ErrorDetected(err.to_string())];
        }

        let mut events = Vec::new();

        if let Some(track_id) = self.profile.match_track_id(&text) {
            if known_track_id != Some(track_id) {
                events.push(OutputEvent::TrackIdentified(track_id.to_string()));
            }
        }

        if let Some(percent) = self.profile.match_progress(&text) {
            events.push(OutputEvent::ProgressUpdate(percent));
        }

        if events.is_empty() {
            events.push(OutputEvent::Unclassified);
        }
        events
    }

    /// Classify one stderr chunk. Anything on stderr is abnormal, so an unmatched
    /// chunk still surfaces as a generic error carrying the raw text.
    pub fn classify_stderr(&self, chunk: &str) -> OutputEvent {
        let text = self.strip_ansi(chunk);
        let err = match self.dictionary.lookup(&text) {
            Some(message) => SupervisorError::RecognizedRuntimeError(message.to_string()),
            None => SupervisorError::UnrecognizedRuntimeError(text.into_owned()),
        };
        OutputEvent::ErrorDetected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Service, ServiceProfile};

    fn profile() -> ServiceProfile {
        ServiceProfile::new(Service::Qobuz).unwrap()
    }

    #[test]
    fn test_strip_ansi() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);
        assert_eq!(
            interp.strip_ansi("\x1b[1;32mDownloading\x1b[0m track-id=1"),
            "Downloading track-id=1"
        );
        assert_eq!(interp.strip_ansi("\x1b]0;title\x07plain"), "plain");
        assert_eq!(interp.strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn test_track_then_progress_on_same_line() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);

        let events = interp.classify_line("track-id=12345 \x1b[33m45.0%\x1b[0m", None);
        assert_eq!(
            events,
            vec![
                OutputEvent::TrackIdentified("12345".to_string()),
                OutputEvent::ProgressUpdate(45.0),
            ]
        );
    }

    #[test]
    fn test_same_track_id_is_not_reannounced() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);

        assert_eq!(
            interp.classify_line("track-id=1", None),
            vec![OutputEvent::TrackIdentified("1".to_string())]
        );
        assert_eq!(
            interp.classify_line("track-id=1", Some("1")),
            vec![OutputEvent::Unclassified]
        );
        assert_eq!(
            interp.classify_line("track-id=1 12.5%", Some("1")),
            vec![OutputEvent::ProgressUpdate(12.5)]
        );
        assert_eq!(
            interp.classify_line("track-id=2", Some("1")),
            vec![OutputEvent::TrackIdentified("2".to_string())]
        );
    }

    #[test]
    fn test_error_line_short_circuits() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);

        let events = interp.classify_line("Found invalid url track-id=9 10.0%", None);
        assert_eq!(
            events,
            vec![OutputEvent::ErrorDetected(
                "Invalid URL detected, skipping.".to_string()
            )]
        );
    }

    #[test]
    fn test_unclassified_line() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);
        assert_eq!(
            interp.classify_line("Logging in...", None),
            vec![OutputEvent::Unclassified]
        );
    }

    #[test]
    fn test_stderr_classification() {
        let profile = profile();
        let dict = ErrorDictionary::builtin();
        let interp = OutputInterpreter::new(&profile, &dict);

        assert_eq!(
            interp.classify_stderr("AuthenticationError: Invalid credentials\n"),
            OutputEvent::ErrorDetected("Invalid Credentials".to_string())
        );
        assert_eq!(
            interp.classify_stderr("Traceback (most recent call last)"),
            OutputEvent::ErrorDetected("Error: Traceback (most recent call last)".to_string())
        );
    }
}
