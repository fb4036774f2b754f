use rust_decimal::Decimal;
use std::str::FromStr;

use crate::domains::export::schema::{lookup, render_value, ColumnDef, Extractor, Record};
use crate::domains::export::types::{EntityType, ExportScope};

use super::{owned_by, EntityProjection};

static INVOICE_COLUMNS: [ColumnDef; 11] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("number", "Invoice #"),
    ColumnDef::new("customer_name", "Customer", Extractor::Text("customer.name")),
    ColumnDef::new("issued_on", "Issued", Extractor::Date("issued_at")),
    ColumnDef::new("due_on", "Due", Extractor::Date("due_at")),
    ColumnDef::text("status", "Status"),
    ColumnDef::new("subtotal", "Subtotal", Extractor::Money("subtotal")),
    ColumnDef::new("tax", "Tax", Extractor::Money("tax")),
    ColumnDef::new("total", "Total", Extractor::Money("total")),
    ColumnDef::new("balance_due", "Balance Due", Extractor::Custom(balance_due)),
    ColumnDef::new("paid", "Paid", Extractor::Flag("paid")),
];

fn decimal_at(record: &Record, path: &str) -> Option<Decimal> {
    lookup(record, path).and_then(|v| Decimal::from_str(render_value(v).trim()).ok())
}

/// Outstanding amount; blank when the invoice has no total.
fn balance_due(record: &Record) -> String {
    match decimal_at(record, "total") {
        Some(total) => {
            let paid = decimal_at(record, "amount_paid").unwrap_or(Decimal::ZERO);
            let balance = (total - paid).max(Decimal::ZERO);
            format!("{:.2}", balance.round_dp(2))
        }
        None => String::new(),
    }
}

pub struct Invoices;

impl EntityProjection for Invoices {
    fn entity_type(&self) -> EntityType {
        EntityType::Invoice
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &INVOICE_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "issued_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}

static PAYMENT_COLUMNS: [ColumnDef; 9] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("invoice_number", "Invoice #"),
    ColumnDef::new("customer_name", "Customer", Extractor::Text("customer.name")),
    ColumnDef::text("method", "Method"),
    ColumnDef::new("amount", "Amount", Extractor::Money("amount")),
    ColumnDef::text("currency", "Currency"),
    ColumnDef::text("status", "Status"),
    ColumnDef::new("paid_at", "Paid", Extractor::DateTime("paid_at")),
    ColumnDef::new("refunded", "Refunded", Extractor::Flag("refunded")),
];

pub struct Payments;

impl EntityProjection for Payments {
    fn entity_type(&self) -> EntityType {
        EntityType::Payment
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &PAYMENT_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "paid_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}
