// Donor entity - the person behind one or more donations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, Database, Event};
use crate::entities::donation::{donation_from_row, Donation, DONATION_COLUMNS};
use crate::error::{LedgerError, LedgerResult};
use crate::store::DonationStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donor {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub whatsapp_number: String,
    pub created_at: DateTime<Utc>,
}

/// Donor with donation totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonorSummary {
    #[serde(flatten)]
    pub donor: Donor,
    pub donation_count: i64,
    pub completed_donations: i64,
}

/// Request body for creating or replacing a donor
#[derive(Debug, Clone, Deserialize)]
pub struct NewDonor {
    pub first_name: String,
    pub last_name: String,
    pub whatsapp_number: String,
}

impl NewDonor {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.first_name.trim().is_empty()
            || self.last_name.trim().is_empty()
            || self.whatsapp_number.trim().is_empty()
        {
            return Err(LedgerError::validation(
                "first name, last name, and WhatsApp number are required",
            ));
        }
        Ok(())
    }
}

const SUMMARY_SELECT: &str = "SELECT dr.id, dr.first_name, dr.last_name, dr.whatsapp_number, dr.created_at,
            COUNT(d.id),
            COALESCE(SUM(CASE WHEN d.status = 'done' THEN 1 ELSE 0 END), 0)
     FROM donors dr
     LEFT JOIN donations d ON d.donor_id = dr.id";

fn donor_from_row(row: &Row<'_>) -> rusqlite::Result<Donor> {
    Ok(Donor {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        whatsapp_number: row.get(3)?,
        created_at: db::timestamp_column(row, 4)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<DonorSummary> {
    Ok(DonorSummary {
        donor: donor_from_row(row)?,
        donation_count: row.get(5)?,
        completed_donations: row.get(6)?,
    })
}

pub fn create_donor(db: &Database, new: &NewDonor) -> LedgerResult<Donor> {
    new.validate()?;

    let donor = db.transaction(|store| {
        let created_at = db::now();
        store.conn().execute(
            "INSERT INTO donors (first_name, last_name, whatsapp_number, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                new.first_name.trim(),
                new.last_name.trim(),
                new.whatsapp_number.trim(),
                db::format_timestamp(created_at),
            ],
        )?;
        let id = store.conn().last_insert_rowid();
        store.record_event(&Event::new("donor_created", "donor", id, serde_json::json!({})))?;

        Ok(Donor {
            id,
            first_name: new.first_name.trim().to_string(),
            last_name: new.last_name.trim().to_string(),
            whatsapp_number: new.whatsapp_number.trim().to_string(),
            created_at,
        })
    })?;

    info!(donor_id = donor.id, "donor created");
    Ok(donor)
}

pub fn donor_exists(conn: &Connection, id: i64) -> LedgerResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM donors WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_donor(conn: &Connection, id: i64) -> LedgerResult<DonorSummary> {
    conn.query_row(
        &format!("{} WHERE dr.id = ?1 GROUP BY dr.id", SUMMARY_SELECT),
        [id],
        summary_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("donor", id))
}

/// All donors, newest first
pub fn list_donors(conn: &Connection) -> LedgerResult<Vec<DonorSummary>> {
    let mut stmt = conn.prepare(&format!(
        "{} GROUP BY dr.id ORDER BY dr.created_at DESC, dr.id DESC",
        SUMMARY_SELECT
    ))?;
    let donors = stmt
        .query_map([], summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(donors)
}

pub fn update_donor(db: &Database, id: i64, update: &NewDonor) -> LedgerResult<Donor> {
    update.validate()?;

    db.transaction(|store| {
        let changed = store.conn().execute(
            "UPDATE donors SET first_name = ?1, last_name = ?2, whatsapp_number = ?3 WHERE id = ?4",
            params![
                update.first_name.trim(),
                update.last_name.trim(),
                update.whatsapp_number.trim(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("donor", id));
        }
        store.record_event(&Event::new("donor_updated", "donor", id, serde_json::json!({})))?;

        let donor = store
            .conn()
            .query_row(
                "SELECT id, first_name, last_name, whatsapp_number, created_at FROM donors WHERE id = ?1",
                [id],
                donor_from_row,
            )?;
        Ok(donor)
    })
}

/// Delete a donor together with their donations (and those donations'
/// shares and assignments)
pub fn delete_donor(db: &Database, id: i64) -> LedgerResult<()> {
    db.transaction(|store| {
        let removed = store.conn().execute("DELETE FROM donors WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(LedgerError::not_found("donor", id));
        }
        store.record_event(&Event::new("donor_deleted", "donor", id, serde_json::json!({})))
    })
}

/// A donor's donations, newest first
pub fn donations_for_donor(conn: &Connection, id: i64) -> LedgerResult<Vec<Donation>> {
    if !donor_exists(conn, id)? {
        return Err(LedgerError::not_found("donor", id));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM donations d
         LEFT JOIN cow_shares cs ON cs.donation_id = d.id
         WHERE d.donor_id = ?1
         ORDER BY d.created_at DESC, d.id DESC",
        DONATION_COLUMNS
    ))?;
    let donations = stmt
        .query_map([id], donation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(donations)
}
