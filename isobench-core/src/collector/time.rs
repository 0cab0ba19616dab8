//! Parser for the `isobench-time v1` report written by GNU `time`.

use crate::error::ParseError;
use std::time::Duration;

pub(crate) const FORMAT: &str = "time";

/// First line of every v1 report
pub const TIME_HEADER: &str = "isobench-time v1";

/// Fields of a v1 time report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReport {
    pub real: Duration,
    pub user: Duration,
    pub sys: Duration,
    pub max_rss_kib: u64,
}

/// Parse a v1 time report
///
/// GNU `time` prefixes the report with a status line when the command fails
/// or is signaled; those lines are skipped. Anything else outside the four
/// labeled fields is rejected.
pub fn parse_time_report(text: &str) -> Result<TimeReport, ParseError> {
    let mut lines = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !is_status_line(line));

    match lines.next() {
        Some(TIME_HEADER) => {}
        Some(other) => {
            return Err(ParseError::UnknownVersion {
                format: FORMAT,
                found: other.to_string(),
            });
        }
        None => return Err(ParseError::MissingOutput { format: FORMAT }),
    }

    let mut real = None;
    let mut user = None;
    let mut sys = None;
    let mut maxrss = None;

    for line in lines {
        let (label, value) = line
            .split_once(' ')
            .ok_or_else(|| unexpected(line))?;
        let value = value.trim();

        match label {
            "real" => store(&mut real, label, parse_seconds(label, value)?)?,
            "user" => store(&mut user, label, parse_seconds(label, value)?)?,
            "sys" => store(&mut sys, label, parse_seconds(label, value)?)?,
            "maxrss" => {
                let kib = value.parse::<u64>().map_err(|_| invalid(label, value))?;
                store(&mut maxrss, label, kib)?
            }
            _ => return Err(unexpected(line)),
        }
    }

    Ok(TimeReport {
        real: real.ok_or_else(|| missing("real"))?,
        user: user.ok_or_else(|| missing("user"))?,
        sys: sys.ok_or_else(|| missing("sys"))?,
        max_rss_kib: maxrss.ok_or_else(|| missing("maxrss"))?,
    })
}

fn is_status_line(line: &str) -> bool {
    line.starts_with("Command exited with non-zero status ")
        || line.starts_with("Command terminated by signal ")
}

fn store<T>(slot: &mut Option<T>, label: &str, value: T) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(ParseError::DuplicateField {
            format: FORMAT,
            field: label.to_string(),
        });
    }
    *slot = Some(value);
    Ok(())
}

/// Decimal seconds such as `1.23`, exact to the microsecond
fn parse_seconds(label: &str, value: &str) -> Result<Duration, ParseError> {
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) if !frac.is_empty() => (whole, frac),
        Some(_) => return Err(invalid(label, value)),
        None => (value, ""),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(whole) || !(frac.is_empty() || digits(frac)) {
        return Err(invalid(label, value));
    }

    let secs: u64 = whole.parse().map_err(|_| invalid(label, value))?;
    let micros = frac
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(6)
        .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
    Ok(Duration::new(secs, micros * 1_000))
}

fn missing(field: &str) -> ParseError {
    ParseError::MissingField {
        format: FORMAT,
        field: field.to_string(),
    }
}

fn invalid(field: &str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        format: FORMAT,
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn unexpected(line: &str) -> ParseError {
    ParseError::UnexpectedLine {
        format: FORMAT,
        line: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "isobench-time v1\nreal 1.25\nuser 0.50\nsys 0.03\nmaxrss 2048\n";

    #[test]
    fn test_parse_report() {
        let report = parse_time_report(REPORT).unwrap();
        assert_eq!(report.real, Duration::from_millis(1250));
        assert_eq!(report.user, Duration::from_millis(500));
        assert_eq!(report.sys, Duration::from_millis(30));
        assert_eq!(report.max_rss_kib, 2048);
    }

    #[test]
    fn test_microsecond_resolution() {
        let text = "isobench-time v1\nreal 0.000123\nuser 0\nsys 0.0000019\nmaxrss 1\n";
        let report = parse_time_report(text).unwrap();
        assert_eq!(report.real, Duration::from_micros(123));
        assert_eq!(report.user, Duration::ZERO);
        // truncated, not rounded
        assert_eq!(report.sys, Duration::from_micros(1));
    }

    #[test]
    fn test_skips_status_lines() {
        let text = format!("Command exited with non-zero status 3\n{REPORT}");
        assert!(parse_time_report(&text).is_ok());
    }

    #[test]
    fn test_missing_labels() {
        let err = parse_time_report("isobench-time v1\nreal 0.01\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                format: FORMAT,
                field: "user".to_string()
            }
        );
    }

    #[test]
    fn test_format_drift_rejected() {
        // default GNU time output, no version header
        let err = parse_time_report("0.00user 0.00system 0:00.01elapsed 0%CPU\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownVersion { .. }));

        let err = parse_time_report(&format!("{REPORT}elapsed 1.0\n")).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedLine { .. }));

        let err = parse_time_report(&format!("{REPORT}real 1.0\n")).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateField { .. }));

        let err = parse_time_report("isobench-time v1\nreal 0:01.25\nuser 0\nsys 0\nmaxrss 1\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(
            parse_time_report("\n").unwrap_err(),
            ParseError::MissingOutput { format: FORMAT }
        );
    }

    #[test]
    fn test_rejects_bad_numbers() {
        for value in ["1.", ".5", "-1", "1e3", "abc"] {
            let text = format!("isobench-time v1\nreal {value}\nuser 0\nsys 0\nmaxrss 1\n");
            assert!(parse_time_report(&text).is_err(), "accepted {value}");
        }
    }
}
