//! Chat-ready order summary rendering.
//!
//! Produces the WhatsApp-style text block for an order: emoji-structured
//! header, labeled fields, bullet item list. Deterministic — no external
//! text-generation service involved.

use chrono::{Datelike, NaiveDate};

use crate::models::OrderRecord;

/// Weekday name for a `YYYY-MM-DD` date, empty for unparsable input.
fn day_of_week(date: &str) -> String {
    match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) => d.weekday().to_string(),
        Err(_) => String::new(),
    }
}

/// Convert `HH:MM` (24h) to `H:MM AM/PM`. Unparsable input passes through.
fn twelve_hour(time: &str) -> String {
    let Some((h, m)) = time.split_once(':') else {
        return time.to_string();
    };
    let Ok(hour) = h.parse::<u32>() else {
        return time.to_string();
    };
    if hour > 23 {
        return time.to_string();
    }
    let (hour12, meridiem) = match hour {
        0 => (12, "AM"),
        1..=11 => (hour, "AM"),
        12 => (12, "PM"),
        _ => (hour - 12, "PM"),
    };
    format!("{hour12}:{m} {meridiem}")
}

fn header_emoji(order_kind: &str) -> &'static str {
    match order_kind.trim().to_ascii_uppercase().as_str() {
        "URGENT" => "🚨",
        "REMINDER" => "📝",
        "TAKE NOTE" => "📌",
        _ => "📦",
    }
}

/// Render the full summary block for a record.
pub fn order_summary(record: &OrderRecord) -> String {
    let weekday = day_of_week(&record.deadline_date);
    let date_line = if weekday.is_empty() {
        format!("{} @ {}", record.deadline_date, twelve_hour(&record.deadline_time))
    } else {
        format!(
            "{weekday}, {} @ {}",
            record.deadline_date,
            twelve_hour(&record.deadline_time)
        )
    };

    let items = if record.items.is_empty() {
        format!("- {} item(s)", record.item_count)
    } else {
        record
            .items
            .iter()
            .map(|i| format!("- {} {} x {}", i.quantity, i.unit, i.name))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let notes = if record.notes.trim().is_empty() {
        "N/A"
    } else {
        record.notes.trim()
    };

    format!(
        "{} *{}*\n\n\
         👤 *Client:* {}\n\
         🗓️ *DATE:* {}\n\
         📍 *Outlet:* {}\n\
         🚨 *Priority:* {}\n\n\
         📝 *Items:*\n{}\n\n\
         ℹ️ *Notes:* {}",
        header_emoji(&record.order_kind),
        record.order_kind,
        record.client_name,
        date_line,
        record.location,
        record.priority,
        items,
        notes
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderDraft, OrderItem, OrderRecord, Priority};

    fn record() -> OrderRecord {
        OrderRecord::from_draft(OrderDraft {
            order_kind: "BULK ORDER".to_string(),
            client_name: "Acme Corp".to_string(),
            // 2025-11-28 is a Friday
            deadline_date: "2025-11-28".to_string(),
            deadline_time: "17:00".to_string(),
            location: "Orchard Branch".to_string(),
            priority: Priority::High,
            items: vec![
                OrderItem::new("Boxes", 10, "boxes"),
                OrderItem::new("Tape", 2, "rolls"),
            ],
            notes: String::new(),
        })
    }

    #[test]
    fn test_summary_layout() {
        let text = order_summary(&record());
        assert!(text.starts_with("📦 *BULK ORDER*"));
        assert!(text.contains("👤 *Client:* Acme Corp"));
        assert!(text.contains("🗓️ *DATE:* Fri, 2025-11-28 @ 5:00 PM"));
        assert!(text.contains("- 10 boxes x Boxes"));
        assert!(text.contains("- 2 rolls x Tape"));
        assert!(text.contains("ℹ️ *Notes:* N/A"));
    }

    #[test]
    fn test_urgent_header_emoji() {
        let mut r = record();
        r.order_kind = "URGENT".to_string();
        assert!(order_summary(&r).starts_with("🚨 *URGENT*"));
    }

    #[test]
    fn test_twelve_hour_conversion() {
        assert_eq!(twelve_hour("00:30"), "12:30 AM");
        assert_eq!(twelve_hour("09:05"), "9:05 AM");
        assert_eq!(twelve_hour("12:00"), "12:00 PM");
        assert_eq!(twelve_hour("17:00"), "5:00 PM");
        assert_eq!(twelve_hour("garbage"), "garbage");
    }

    #[test]
    fn test_remote_record_uses_item_count() {
        let mut r = record();
        r.items.clear();
        r.item_count = 4;
        assert!(order_summary(&r).contains("- 4 item(s)"));
    }
}
