//! Parser for `perf stat -x ';'` CSV output.
//!
//! Each counter line is `value;unit;event;...`. Comment lines start with `#`.

use crate::error::ParseError;
use std::collections::BTreeMap;

pub(crate) const FORMAT: &str = "perf-stat";

/// Parse counter values, keyed by requested event name
///
/// Unprivileged runs report events with a modifier suffix (`cycles:u`); such
/// a line satisfies the plain request. Every event in `required` must be
/// present and counted; with no required events at least one counter must be.
pub fn parse_perf_report(
    text: &str,
    required: &[String],
) -> Result<BTreeMap<String, f64>, ParseError> {
    let mut seen: BTreeMap<String, f64> = BTreeMap::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 3 || fields[2].trim().is_empty() {
            return Err(ParseError::UnexpectedLine {
                format: FORMAT,
                line: line.to_string(),
            });
        }
        let raw = fields[0].trim();
        let event = fields[2].trim();

        if raw.starts_with('<') {
            return Err(ParseError::CounterUnavailable {
                format: FORMAT,
                counter: event.to_string(),
                reason: raw.trim_matches(|c| c == '<' || c == '>').to_string(),
            });
        }

        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::InvalidValue {
                format: FORMAT,
                field: event.to_string(),
                value: raw.to_string(),
            })?;

        if seen.insert(event.to_string(), value).is_some() {
            return Err(ParseError::DuplicateField {
                format: FORMAT,
                field: event.to_string(),
            });
        }
    }

    if required.is_empty() {
        if seen.is_empty() {
            return Err(ParseError::MissingOutput { format: FORMAT });
        }
        return Ok(seen);
    }

    required
        .iter()
        .map(|name| {
            let value = seen.get(name.as_str()).copied().or_else(|| {
                seen.iter()
                    .find(|(event, _)| {
                        event
                            .strip_prefix(name.as_str())
                            .is_some_and(|rest| rest.starts_with(':'))
                    })
                    .map(|(_, v)| *v)
            });
            value
                .map(|v| (name.clone(), v))
                .ok_or_else(|| ParseError::MissingField {
                    format: FORMAT,
                    field: name.clone(),
                })
        })
        .collect()
}
