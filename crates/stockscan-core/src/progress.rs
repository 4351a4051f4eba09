use std::sync::OnceLock;

use regex::Regex;

/// Marker for a plain log line: `[LOG] <message>`.
pub const LOG_MARKER: &str = "[LOG]";

#[derive(Clone, Debug, PartialEq)]
pub enum LineEvent {
    Progress(ProgressUpdate),
    Log(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    /// Clamped to 0..=100. Monotonicity is enforced by the status store,
    /// not here; the parser is stateless per call.
    pub pct: f64,
    pub message: String,
    pub counters: Vec<(String, u64)>,
}

/// Live progress marker: `[PROGRESS] <pct> <message>`. The scripts log
/// through a framework that prefixes a timestamp, so the marker may appear
/// anywhere in the line.
fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[PROGRESS\]\s*(\d+(?:\.\d+)?)\s*(.*)").expect("progress marker regex")
    })
}

fn counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*/\s*(\d+)").expect("counter regex"))
}

/// Classify one streamed output line. Anything that is not a recognized
/// progress marker comes back as a plain log event; the caller appends the
/// raw line to the task log either way.
pub fn parse_line(line: &str) -> LineEvent {
    if let Some(caps) = progress_re().captures(line) {
        let pct = caps[1].parse::<f64>().unwrap_or(0.0).clamp(0.0, 100.0);
        let message = caps[2].trim().to_string();
        let counters = parse_counters(&message);
        return LineEvent::Progress(ProgressUpdate {
            pct,
            message,
            counters,
        });
    }

    if let Some(idx) = line.find(LOG_MARKER) {
        return LineEvent::Log(line[idx + LOG_MARKER.len()..].trim().to_string());
    }

    LineEvent::Log(line.trim_end().to_string())
}

/// Extract an embedded `N/M` completion counter ("saved 120/2600") from a
/// progress message.
fn parse_counters(message: &str) -> Vec<(String, u64)> {
    let Some(caps) = counter_re().captures(message) else {
        return Vec::new();
    };
    match (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
        (Ok(completed), Ok(total)) => vec![
            ("completed".to_string(), completed),
            ("total".to_string(), total),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{LineEvent, parse_line};

    #[test]
    fn progress_marker_with_percentage_and_message() {
        let event = parse_line("[PROGRESS] 30.0 downloading per-symbol data");
        let LineEvent::Progress(update) = event else {
            panic!("expected progress event");
        };
        assert_eq!(update.pct, 30.0);
        assert_eq!(update.message, "downloading per-symbol data");
        assert!(update.counters.is_empty());
    }

    #[test]
    fn marker_after_logging_prefix_is_recognized() {
        let event = parse_line("2024-10-27 12:00:01,532 - INFO - [PROGRESS] 42.5 saving symbols");
        let LineEvent::Progress(update) = event else {
            panic!("expected progress event");
        };
        assert_eq!(update.pct, 42.5);
    }

    #[test]
    fn embedded_counter_is_extracted() {
        let event = parse_line("[PROGRESS] 55.1 saved 120/2600");
        let LineEvent::Progress(update) = event else {
            panic!("expected progress event");
        };
        assert_eq!(
            update.counters,
            vec![("completed".to_string(), 120), ("total".to_string(), 2600)]
        );
    }

    #[test]
    fn percentage_is_clamped() {
        let LineEvent::Progress(update) = parse_line("[PROGRESS] 140.0 overshoot") else {
            panic!("expected progress event");
        };
        assert_eq!(update.pct, 100.0);
    }

    #[test]
    fn log_marker_strips_prefix() {
        assert_eq!(
            parse_line("2024-10-27 12:00:02,001 - INFO - [LOG] cache hit"),
            LineEvent::Log("cache hit".to_string())
        );
    }

    #[test]
    fn unrecognized_line_is_plain_log() {
        assert_eq!(
            parse_line("Traceback (most recent call last):"),
            LineEvent::Log("Traceback (most recent call last):".to_string())
        );
    }

    #[test]
    fn progress_marker_without_number_is_plain_log() {
        assert!(matches!(
            parse_line("[PROGRESS] soon"),
            LineEvent::Log(_)
        ));
    }
}
