use chrono::{DateTime, Utc};
use serde_derive::Serialize;

/// A loanable device.
///
/// `tag_nr` is the EPC of the RFID tag stuck to the device, if it has one.
/// When `is_borrowed` is false, `borrower_id` and `borrowed_at` are both
/// `None`; the table enforces this with a CHECK constraint.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub tag_nr: Option<String>,
    pub qr_code: String,
    pub is_borrowed: bool,
    pub borrower_id: Option<i64>,
    pub borrowed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Borrower {
    pub id: i64,
    pub name: String,
    pub matriculation_number: String,
    pub email: Option<String>,
    pub nfc_uid: Option<String>,
}

impl Device {
    pub fn is_consistent(&self) -> bool {
        self.is_borrowed || (self.borrower_id.is_none() && self.borrowed_at.is_none())
    }
}
