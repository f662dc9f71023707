use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use super::Database;
use super::models::{Borrower, Device};
use crate::error::RepositoryError;

/// Borrow-state lookups the alarm protocol depends on.
///
/// Implementations are read-only from the protocol's point of view; borrow
/// state only changes through the kiosk workflow.
pub trait BorrowRepository: Send + Sync {
    /// `None` when no device carries this tag.
    fn is_borrowed(
        &self,
        tag_nr: &str,
    ) -> impl Future<Output = Result<Option<bool>, RepositoryError>> + Send;

    fn name_for_qr_code(
        &self,
        qr_code: &str,
    ) -> impl Future<Output = Result<Option<String>, RepositoryError>> + Send;

    fn id_for_device_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<i64>, RepositoryError>> + Send;

    /// Drops and reopens the underlying connections.
    fn refresh_connection(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

const DEVICE_COLUMNS: &str =
    "id, name, tag_nr, qr_code, is_borrowed, borrower_id, borrowed_at";

#[derive(Debug, Clone)]
pub struct SqliteRepository {
    db: Arc<Database>,
}

impl SqliteRepository {
    pub fn new(db: Arc<Database>) -> Self {
        SqliteRepository { db }
    }

    pub async fn add_device(
        &self,
        name: &str,
        qr_code: &str,
        tag_nr: Option<&str>,
    ) -> Result<i64, RepositoryError> {
        let result = sqlx::query("INSERT INTO devices (name, qr_code, tag_nr) VALUES (?, ?, ?)")
            .bind(name)
            .bind(qr_code)
            .bind(tag_nr)
            .execute(&self.db.pool().await)
            .await?;
        info!("Added device {name}");
        Ok(result.last_insert_rowid())
    }

    pub async fn assign_tag(&self, device_id: i64, tag_nr: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE devices SET tag_nr = ? WHERE id = ?")
            .bind(tag_nr)
            .bind(device_id)
            .execute(&self.db.pool().await)
            .await?;
        if result.rows_affected() == 0 {
            return Err(device_not_found(device_id));
        }
        Ok(())
    }

    pub async fn find_by_qr_code(&self, qr_code: &str) -> Result<Option<Device>, RepositoryError> {
        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE qr_code = ?"
        ))
        .bind(qr_code)
        .fetch_optional(&self.db.pool().await)
        .await?;
        Ok(device)
    }

    pub async fn find_by_id(&self, device_id: i64) -> Result<Option<Device>, RepositoryError> {
        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
        ))
        .bind(device_id)
        .fetch_optional(&self.db.pool().await)
        .await?;
        Ok(device)
    }

    pub async fn all_devices(&self) -> Result<Vec<Device>, RepositoryError> {
        let devices = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY name"
        ))
        .fetch_all(&self.db.pool().await)
        .await?;
        Ok(devices)
    }

    /// Marks the device as borrowed by `borrower_id`, stamped now.
    pub async fn borrow_device(&self, device_id: i64, borrower_id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET is_borrowed = 1, borrower_id = ?, borrowed_at = ?
            WHERE id = ? AND is_borrowed = 0
            "#,
        )
        .bind(borrower_id)
        .bind(Utc::now())
        .bind(device_id)
        .execute(&self.db.pool().await)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(device_id).await? {
                Some(device) => Err(RepositoryError::AlreadyBorrowed(device.name)),
                None => Err(device_not_found(device_id)),
            };
        }
        info!("Device {device_id} borrowed by {borrower_id}");
        Ok(())
    }

    /// Clears borrowed flag, borrower and date together.
    pub async fn return_device(&self, device_id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET is_borrowed = 0, borrower_id = NULL, borrowed_at = NULL
            WHERE id = ? AND is_borrowed = 1
            "#,
        )
        .bind(device_id)
        .execute(&self.db.pool().await)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(device_id).await? {
                Some(device) => Err(RepositoryError::NotBorrowed(device.name)),
                None => Err(device_not_found(device_id)),
            };
        }
        info!("Device {device_id} returned");
        Ok(())
    }

    pub async fn delete_device(&self, device_id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(device_id)
            .execute(&self.db.pool().await)
            .await?;
        if result.rows_affected() == 0 {
            return Err(device_not_found(device_id));
        }
        info!("Deleted device {device_id}");
        Ok(())
    }

    pub async fn add_borrower(
        &self,
        name: &str,
        matriculation_number: &str,
        email: Option<&str>,
        nfc_uid: Option<&str>,
    ) -> Result<i64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO borrowers (name, matriculation_number, email, nfc_uid) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(matriculation_number)
        .bind(email)
        .bind(nfc_uid)
        .execute(&self.db.pool().await)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn borrower_by_card_uid(&self, nfc_uid: &str) -> Result<Option<Borrower>, RepositoryError> {
        let borrower = sqlx::query_as::<_, Borrower>(
            "SELECT id, name, matriculation_number, email, nfc_uid FROM borrowers WHERE nfc_uid = ?",
        )
        .bind(nfc_uid)
        .fetch_optional(&self.db.pool().await)
        .await?;
        Ok(borrower)
    }
}

impl BorrowRepository for SqliteRepository {
    async fn is_borrowed(&self, tag_nr: &str) -> Result<Option<bool>, RepositoryError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_borrowed FROM devices WHERE tag_nr = ?")
            .bind(tag_nr)
            .fetch_optional(&self.db.pool().await)
            .await?;
        if row.is_none() {
            warn!("No device with tag number {tag_nr}");
        }
        Ok(row.map(|(borrowed,)| borrowed))
    }

    async fn name_for_qr_code(&self, qr_code: &str) -> Result<Option<String>, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM devices WHERE qr_code = ?")
            .bind(qr_code)
            .fetch_optional(&self.db.pool().await)
            .await?;
        Ok(row.map(|(name,)| name))
    }

    async fn id_for_device_name(&self, name: &str) -> Result<Option<i64>, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM devices WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.db.pool().await)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn refresh_connection(&self) -> Result<(), RepositoryError> {
        self.db.refresh().await
    }
}

fn device_not_found(device_id: i64) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "device",
        field: "id",
        value: device_id.to_string(),
    }
}
