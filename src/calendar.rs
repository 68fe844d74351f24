//! Calendar invite (.ics) generation for order deadlines.
//!
//! One VEVENT per order: starts at the deadline, runs an hour, carries the
//! item list in the description and a 15-minute display alarm.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::{RelayError, Result};
use crate::models::OrderRecord;

/// ICS UTC timestamp, e.g. `20251128T090000Z`.
fn format_ics_date(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Parse the order's deadline as a local wall-clock instant.
fn deadline_instant(record: &OrderRecord) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(&record.deadline_date, "%Y-%m-%d")
        .map_err(|e| RelayError::Configuration(format!("invalid deadline date: {e}")))?;
    let time = NaiveTime::parse_from_str(&record.deadline_time, "%H:%M")
        .map_err(|e| RelayError::Configuration(format!("invalid deadline time: {e}")))?;
    let naive = NaiveDateTime::new(date, time);
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| RelayError::Configuration("deadline falls in a DST gap".to_string()))?;
    Ok(local.with_timezone(&Utc))
}

/// Escape text per RFC 5545: backslash, comma, semicolon, and newlines.
fn escape_ics_text(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(';', "\\;")
        .replace('\n', "\\n")
}

/// Render a VCALENDAR invite for the order's deadline.
pub fn ics_invite(record: &OrderRecord) -> Result<String> {
    let start = deadline_instant(record)?;
    let end = start + chrono::Duration::hours(1);

    let items = record
        .items
        .iter()
        .map(|i| format!("- {} {} {}", i.quantity, i.unit, i.name))
        .collect::<Vec<_>>()
        .join("\n");
    let location = if record.location.trim().is_empty() {
        "Logistics Center"
    } else {
        record.location.trim()
    };
    let description = escape_ics_text(&format!(
        "Type: {}\nClient: {}\nOutlet: {}\n\nItems:\n{}",
        record.order_kind, record.client_name, location, items
    ));
    let uid = format!(
        "{}-{}@bulkorderpro.com",
        record.order_kind.replace(char::is_whitespace, ""),
        record.client_request_id
    );

    Ok(format!(
        "BEGIN:VCALENDAR\r\n\
         VERSION:2.0\r\n\
         PRODID:-//BulkOrderPro//EN\r\n\
         BEGIN:VEVENT\r\n\
         UID:{uid}\r\n\
         DTSTAMP:{stamp}\r\n\
         DTSTART:{start}\r\n\
         DTEND:{end}\r\n\
         SUMMARY:{summary}\r\n\
         DESCRIPTION:{description}\r\n\
         LOCATION:{location}\r\n\
         BEGIN:VALARM\r\n\
         TRIGGER:-PT15M\r\n\
         ACTION:DISPLAY\r\n\
         DESCRIPTION:Reminder\r\n\
         END:VALARM\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR\r\n",
        uid = uid,
        stamp = format_ics_date(Utc::now()),
        start = format_ics_date(start),
        end = format_ics_date(end),
        summary = escape_ics_text(&format!("{}: {}", record.order_kind, record.client_name)),
        description = description,
        location = escape_ics_text(location),
    ))
}

/// File name for a saved invite, e.g. `BULK_ORDER_Acme_Corp.ics`.
pub fn ics_file_name(record: &OrderRecord) -> String {
    let kind = record.order_kind.trim().replace(char::is_whitespace, "_");
    let client = record.client_name.trim().replace(char::is_whitespace, "_");
    let client = if client.is_empty() {
        "Order".to_string()
    } else {
        client
    };
    format!("{kind}_{client}.ics")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderDraft, OrderItem, Priority};

    fn record() -> OrderRecord {
        OrderRecord::from_draft(OrderDraft {
            order_kind: "BULK ORDER".to_string(),
            client_name: "Acme Corp".to_string(),
            deadline_date: "2025-11-28".to_string(),
            deadline_time: "17:00".to_string(),
            location: "Orchard Branch".to_string(),
            priority: Priority::Normal,
            items: vec![OrderItem::new("Boxes", 10, "boxes")],
            notes: String::new(),
        })
    }

    #[test]
    fn test_invite_structure() {
        let ics = ics_invite(&record()).unwrap();
        assert!(ics.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(ics.ends_with("END:VCALENDAR\r\n"));
        assert!(ics.contains("SUMMARY:BULK ORDER: Acme Corp"));
        assert!(ics.contains("LOCATION:Orchard Branch"));
        assert!(ics.contains("TRIGGER:-PT15M"));
        assert!(ics.contains("- 10 boxes Boxes"));
    }

    #[test]
    fn test_event_duration_is_one_hour() {
        let ics = ics_invite(&record()).unwrap();
        let start = ics
            .lines()
            .find_map(|l| l.strip_prefix("DTSTART:"))
            .unwrap()
            .trim_end();
        let end = ics
            .lines()
            .find_map(|l| l.strip_prefix("DTEND:"))
            .unwrap()
            .trim_end();
        let parse = |s: &str| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%SZ").expect("ics timestamp")
        };
        assert_eq!(parse(end) - parse(start), chrono::Duration::hours(1));
    }

    #[test]
    fn test_invalid_deadline_is_a_configuration_error() {
        let mut r = record();
        r.deadline_date = "28/11/2025".to_string();
        assert!(matches!(
            ics_invite(&r),
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn test_description_escapes_newlines_and_commas() {
        let mut r = record();
        r.client_name = "Acme, Inc".to_string();
        let ics = ics_invite(&r).unwrap();
        assert!(ics.contains("Client: Acme\\, Inc"));
        assert!(ics.contains("Items:\\n"));
    }

    #[test]
    fn test_file_name_sanitization() {
        let mut r = record();
        assert_eq!(ics_file_name(&r), "BULK_ORDER_Acme_Corp.ics");
        r.client_name = "  ".to_string();
        assert_eq!(ics_file_name(&r), "BULK_ORDER_Order.ics");
    }
}
