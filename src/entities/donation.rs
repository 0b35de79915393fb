// Donation entity - one pledged sheep or cow share
//
// Status only moves forward: pending -> sending -> done.
// A cow donation is placed into a cow group in the same transaction that
// creates it; a sheep donation never has a group.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::db::{self, Database, Event};
use crate::entities::donor;
use crate::error::{LedgerError, LedgerResult};
use crate::grouping::{self, COW_GROUP_CAPACITY};
use crate::store::DonationStore;

// ============================================================================
// DONATION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationKind {
    /// A whole sheep, distributed on its own
    Sheep,

    /// One seventh of a cow, distributed with the rest of its group
    Cow,
}

impl DonationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationKind::Sheep => "sheep",
            DonationKind::Cow => "cow",
        }
    }
}

impl fmt::Display for DonationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sheep" => Ok(DonationKind::Sheep),
            "cow" => Ok(DonationKind::Cow),
            other => Err(LedgerError::validation(format!(
                "type must be either \"sheep\" or \"cow\", got {:?}",
                other
            ))),
        }
    }
}

impl ToSql for DonationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DonationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

// ============================================================================
// DONATION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationStatus {
    Pending,
    Sending,
    Done,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationStatus::Pending => "pending",
            DonationStatus::Sending => "sending",
            DonationStatus::Done => "done",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DonationStatus::Pending => 0,
            DonationStatus::Sending => 1,
            DonationStatus::Done => 2,
        }
    }

    /// Forward moves only; staying put is allowed
    pub fn can_advance_to(&self, next: DonationStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DonationStatus::Pending),
            "sending" => Ok(DonationStatus::Sending),
            "done" => Ok(DonationStatus::Done),
            other => Err(LedgerError::validation(format!(
                "status must be either \"pending\", \"sending\", or \"done\", got {:?}",
                other
            ))),
        }
    }
}

impl ToSql for DonationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DonationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: i64,
    pub donor_id: i64,
    pub price: f64,
    #[serde(rename = "type")]
    pub kind: DonationKind,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set for cow donations only
    pub cow_group_id: Option<i64>,
}

/// Donation joined with its donor's contact details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationDetail {
    #[serde(flatten)]
    pub donation: Donation,
    pub first_name: String,
    pub last_name: String,
    pub whatsapp_number: String,
}

/// Request body for a new donation
#[derive(Debug, Clone, Deserialize)]
pub struct NewDonation {
    pub donor_id: i64,
    pub price: f64,
    #[serde(rename = "type", alias = "kind")]
    pub kind: DonationKind,
}

impl NewDonation {
    pub fn validate(&self) -> LedgerResult<()> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(LedgerError::validation("price must be a positive amount"));
        }
        Ok(())
    }
}

/// Pending workload summary shown on the dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardCounts {
    pub pending_sheep_count: i64,
    pub pending_cow_shares_count: i64,
    pub pending_cow_groups: i64,
    pub remaining_cow_shares: i64,
    pub total_value: f64,
}

pub(crate) const DONATION_COLUMNS: &str =
    "d.id, d.donor_id, d.price, d.kind, d.status, d.created_at, d.completed_at, cs.cow_group_id";

const DETAIL_SELECT: &str = "SELECT d.id, d.donor_id, d.price, d.kind, d.status, d.created_at,
            d.completed_at, cs.cow_group_id,
            dn.first_name, dn.last_name, dn.whatsapp_number
     FROM donations d
     JOIN donors dn ON dn.id = d.donor_id
     LEFT JOIN cow_shares cs ON cs.donation_id = d.id";

/// Reads the eight columns of DONATION_COLUMNS starting at index 0
pub(crate) fn donation_from_row(row: &Row<'_>) -> rusqlite::Result<Donation> {
    Ok(Donation {
        id: row.get(0)?,
        donor_id: row.get(1)?,
        price: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        created_at: db::timestamp_column(row, 5)?,
        completed_at: db::optional_timestamp_column(row, 6)?,
        cow_group_id: row.get(7)?,
    })
}

pub(crate) fn detail_from_row(row: &Row<'_>) -> rusqlite::Result<DonationDetail> {
    Ok(DonationDetail {
        donation: donation_from_row(row)?,
        first_name: row.get(8)?,
        last_name: row.get(9)?,
        whatsapp_number: row.get(10)?,
    })
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Create a donation; cow donations are placed into a cow group atomically.
///
/// Nothing is written unless the group placement also succeeds.
pub fn create_donation(db: &Database, new: &NewDonation) -> LedgerResult<Donation> {
    new.validate()?;

    let donation = db.transaction(|store| {
        let conn = store.conn();
        if !donor::donor_exists(conn, new.donor_id)? {
            return Err(LedgerError::not_found("donor", new.donor_id));
        }

        let created_at = db::now();
        conn.execute(
            "INSERT INTO donations (donor_id, price, kind, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.donor_id,
                new.price,
                new.kind,
                DonationStatus::Pending,
                db::format_timestamp(created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();

        let cow_group_id = match new.kind {
            DonationKind::Cow => Some(grouping::place_cow_donation(store, id)?),
            DonationKind::Sheep => None,
        };

        store.record_event(&Event::new(
            "donation_created",
            "donation",
            id,
            serde_json::json!({
                "donor_id": new.donor_id,
                "type": new.kind,
                "price": new.price,
                "cow_group_id": cow_group_id,
            }),
        ))?;

        Ok(Donation {
            id,
            donor_id: new.donor_id,
            price: new.price,
            kind: new.kind,
            status: DonationStatus::Pending,
            created_at,
            completed_at: None,
            cow_group_id,
        })
    })?;

    info!(
        donation_id = donation.id,
        kind = %donation.kind,
        cow_group_id = ?donation.cow_group_id,
        "donation created"
    );
    Ok(donation)
}

pub fn get_donation(conn: &Connection, id: i64) -> LedgerResult<DonationDetail> {
    conn.query_row(&format!("{} WHERE d.id = ?1", DETAIL_SELECT), [id], detail_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found("donation", id))
}

/// All donations, newest first
pub fn list_donations(conn: &Connection) -> LedgerResult<Vec<DonationDetail>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY d.created_at DESC, d.id DESC", DETAIL_SELECT))?;
    let rows = stmt
        .query_map([], detail_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Donations in one status, oldest first
pub fn donations_by_status(
    conn: &Connection,
    status: DonationStatus,
) -> LedgerResult<Vec<DonationDetail>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE d.status = ?1 ORDER BY d.created_at ASC, d.id ASC",
        DETAIL_SELECT
    ))?;
    let rows = stmt
        .query_map([status], detail_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move a donation forward in its lifecycle. Moving to `done` stamps
/// `completed_at`; moving backwards is rejected.
pub fn update_status(db: &Database, id: i64, status: DonationStatus) -> LedgerResult<Donation> {
    db.transaction(|store| {
        let conn = store.conn();
        let current = load_donation(conn, id)?;

        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_advance_to(status) {
            return Err(LedgerError::validation(format!(
                "donation {} cannot move from {} back to {}",
                id, current.status, status
            )));
        }

        let completed_at = match status {
            DonationStatus::Done => Some(db::now()),
            _ => current.completed_at,
        };
        conn.execute(
            "UPDATE donations SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status, completed_at.map(db::format_timestamp), id],
        )?;

        store.record_event(&Event::new(
            "status_changed",
            "donation",
            id,
            serde_json::json!({"from": current.status, "to": status}),
        ))?;

        Ok(Donation {
            status,
            completed_at,
            ..current
        })
    })
}

pub fn delete_donation(db: &Database, id: i64) -> LedgerResult<()> {
    db.transaction(|store| {
        let removed = store
            .conn()
            .execute("DELETE FROM donations WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(LedgerError::not_found("donation", id));
        }
        store.record_event(&Event::new("donation_deleted", "donation", id, serde_json::json!({})))
    })
}

/// Pending sheep, pending cow shares, and the value still waiting to go out
pub fn dashboard_counts(conn: &Connection) -> LedgerResult<DashboardCounts> {
    let (pending_sheep_count, pending_cow_shares_count, total_value): (i64, i64, f64) = conn
        .query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN kind = 'sheep' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN kind = 'cow' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(price), 0.0)
             FROM donations
             WHERE status = 'pending'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

    let capacity = i64::from(COW_GROUP_CAPACITY);
    Ok(DashboardCounts {
        pending_sheep_count,
        pending_cow_shares_count,
        pending_cow_groups: pending_cow_shares_count / capacity,
        remaining_cow_shares: pending_cow_shares_count % capacity,
        total_value,
    })
}

fn load_donation(conn: &Connection, id: i64) -> LedgerResult<Donation> {
    conn.query_row(
        &format!(
            "SELECT {} FROM donations d LEFT JOIN cow_shares cs ON cs.donation_id = d.id WHERE d.id = ?1",
            DONATION_COLUMNS
        ),
        [id],
        donation_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("donation", id))
}
