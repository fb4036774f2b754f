use crate::domains::export::schema::{lookup, parse_instant, ColumnDef, Extractor, Record};
use crate::domains::export::types::{EntityType, ExportScope};

use super::{owned_by, EntityProjection};

static SITE_ADDRESS: [&str; 3] = ["site.line1", "site.city", "site.postcode"];

static SERVICE_COLUMNS: [ColumnDef; 11] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("reference", "Reference"),
    ColumnDef::new("customer_name", "Customer", Extractor::Text("customer.name")),
    ColumnDef::text("service_type", "Service Type"),
    ColumnDef::text("status", "Status"),
    ColumnDef::text("priority", "Priority"),
    ColumnDef::new("site_address", "Site Address", Extractor::Joined(&SITE_ADDRESS)),
    ColumnDef::new("scheduled_for", "Scheduled For", Extractor::DateTime("scheduled_for")),
    ColumnDef::new("technician", "Technician", Extractor::Text("technician.name")),
    ColumnDef::new("quoted_total", "Quoted Total", Extractor::Money("quote.total")),
    ColumnDef::new("created_at", "Created", Extractor::DateTime("created_at")),
];

/// Service requests raised by customers.
pub struct ServiceRequests;

impl EntityProjection for ServiceRequests {
    fn entity_type(&self) -> EntityType {
        EntityType::Service
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &SERVICE_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "created_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}

static EMERGENCY_LOCATION: [&str; 3] = ["location.line1", "location.city", "location.postcode"];

static EMERGENCY_COLUMNS: [ColumnDef; 10] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("reference", "Reference"),
    ColumnDef::text("category", "Category"),
    ColumnDef::text("severity", "Severity"),
    ColumnDef::new("location", "Location", Extractor::Joined(&EMERGENCY_LOCATION)),
    ColumnDef::new("reported_by", "Reported By", Extractor::Text("reporter.name")),
    ColumnDef::text("status", "Status"),
    ColumnDef::new("reported_at", "Reported", Extractor::DateTime("reported_at")),
    ColumnDef::new("resolved_at", "Resolved", Extractor::DateTime("resolved_at")),
    ColumnDef::new("response_minutes", "Response (min)", Extractor::Custom(response_minutes)),
];

/// Minutes between report and first response, blank while unanswered.
fn response_minutes(record: &Record) -> String {
    let at = |field: &str| {
        lookup(record, field)
            .and_then(|v| v.as_str())
            .and_then(parse_instant)
    };
    match (at("reported_at"), at("responded_at")) {
        (Some(reported), Some(responded)) if responded >= reported => {
            (responded - reported).num_minutes().to_string()
        }
        _ => String::new(),
    }
}

/// Out-of-hours emergency call-outs.
pub struct Emergencies;

impl EntityProjection for Emergencies {
    fn entity_type(&self) -> EntityType {
        EntityType::Emergency
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &EMERGENCY_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "reported_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id", "reporter.id"], scope)
    }
}

static INQUIRY_COLUMNS: [ColumnDef; 9] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("subject", "Subject"),
    ColumnDef::text("name", "Name"),
    ColumnDef::text("email", "Email"),
    ColumnDef::text("phone", "Phone"),
    ColumnDef::text("channel", "Channel"),
    ColumnDef::text("status", "Status"),
    ColumnDef::text("message", "Message"),
    ColumnDef::new("received_at", "Received", Extractor::DateTime("received_at")),
];

/// Contact-form and phone inquiries.
pub struct Inquiries;

impl EntityProjection for Inquiries {
    fn entity_type(&self) -> EntityType {
        EntityType::Inquiry
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &INQUIRY_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "received_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}

static MESSAGE_COLUMNS: [ColumnDef; 8] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::new("thread", "Thread", Extractor::Text("thread_id")),
    ColumnDef::new("from", "From", Extractor::Text("sender.name")),
    ColumnDef::new("to", "To", Extractor::Text("recipient.name")),
    ColumnDef::text("subject", "Subject"),
    ColumnDef::text("body", "Body"),
    ColumnDef::new("read", "Read", Extractor::Flag("read")),
    ColumnDef::new("sent_at", "Sent", Extractor::DateTime("sent_at")),
];

/// Portal messages; visible to either party.
pub struct Messages;

impl EntityProjection for Messages {
    fn entity_type(&self) -> EntityType {
        EntityType::Message
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &MESSAGE_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "sent_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["sender.id", "recipient.id"], scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn emergency_response_time_in_minutes() {
        let record = json!({
            "reported_at": "2025-05-01T22:00:00Z",
            "responded_at": "2025-05-01T22:45:30Z"
        })
        .as_object()
        .cloned()
        .unwrap();
        assert_eq!(response_minutes(&record), "45");

        let open = json!({"reported_at": "2025-05-01T22:00:00Z"}).as_object().cloned().unwrap();
        assert_eq!(response_minutes(&open), "");
    }

    #[test]
    fn messages_are_visible_to_sender_and_recipient() {
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let record = json!({
            "sender": {"id": sender.to_string()},
            "recipient": {"id": recipient.to_string()}
        })
        .as_object()
        .cloned()
        .unwrap();
        let scope_for = |owner| ExportScope {
            tenant_id: Uuid::nil(),
            owner_id: owner,
            restrict_to_owner: true,
        };
        assert!(Messages.scope_matches(&record, &scope_for(sender)));
        assert!(Messages.scope_matches(&record, &scope_for(recipient)));
        assert!(!Messages.scope_matches(&record, &scope_for(Uuid::new_v4())));
    }
}
