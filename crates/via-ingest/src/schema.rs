//! Raw-line parsing via per-source schema records.
//!
//! Sources that cannot ship structured events register a [`SchemaRecord`]
//! describing their delimiters, field order, and timestamp format; the
//! ingestor turns their raw lines into [`LogEvent`]s. Unparseable lines are
//! `BAD_EVENT`s and count as `parse_failed`.

use chrono::NaiveDateTime;

use via_types::{LogEvent, SchemaField, SchemaRecord, ViaError};

/// Parse one raw line according to `schema`.
///
/// Fields are consumed in `field_order`; the message field swallows the
/// rest of the line. Timestamps are interpreted as UTC.
pub fn parse_line(schema: &SchemaRecord, line: &str) -> Result<LogEvent, ViaError> {
    let is_delim = |c: char| schema.delimiters.contains(c);

    let mut rest = line.trim_start_matches(&is_delim);
    let mut ts = None;
    let mut service = None;
    let mut level = None;
    let mut message = None;

    for field in &schema.field_order {
        if *field == SchemaField::Message {
            let text = rest.trim();
            if text.is_empty() {
                return Err(ViaError::BadEvent("line has no message field".into()));
            }
            message = Some(text.to_string());
            rest = "";
            continue;
        }

        let token_end = rest.find(&is_delim).unwrap_or(rest.len());
        let (token, remainder) = rest.split_at(token_end);
        rest = remainder.trim_start_matches(&is_delim);
        if token.is_empty() {
            return Err(ViaError::BadEvent(format!(
                "line ended before {field:?} field"
            )));
        }

        match field {
            SchemaField::Timestamp => {
                let parsed = NaiveDateTime::parse_from_str(token, &schema.timestamp_format)
                    .map_err(|e| ViaError::BadEvent(format!("bad timestamp `{token}`: {e}")))?;
                ts = Some(parsed.and_utc().timestamp());
            }
            SchemaField::Service => service = Some(token.to_string()),
            SchemaField::Level => level = Some(token.parse()?),
            SchemaField::Skip => {}
            SchemaField::Message => unreachable!("handled above"),
        }
    }

    let event = LogEvent {
        ts: ts.ok_or_else(|| ViaError::BadEvent("schema yields no timestamp".into()))?,
        service: service.ok_or_else(|| ViaError::BadEvent("schema yields no service".into()))?,
        level: level.ok_or_else(|| ViaError::BadEvent("schema yields no level".into()))?,
        message: message.ok_or_else(|| ViaError::BadEvent("schema yields no message".into()))?,
        attributes: Default::default(),
    };
    event.validate()?;
    Ok(event)
}
