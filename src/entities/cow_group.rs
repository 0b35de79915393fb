// Cow group entity - read side only
//
// Groups are opened and filled by the grouping engine; nothing here
// creates groups or moves shares.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::db;
use crate::entities::donation::DonationStatus;
use crate::error::{LedgerError, LedgerResult};
use crate::grouping::COW_GROUP_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CowGroup {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub share_count: u32,
}

impl CowGroup {
    pub fn is_complete(&self) -> bool {
        self.share_count == COW_GROUP_CAPACITY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareDonor {
    pub first_name: String,
    pub last_name: String,
    pub whatsapp_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CowShareView {
    pub donation_id: i64,
    pub status: DonationStatus,
    pub donor: ShareDonor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CowGroupDetail {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub shares: Vec<CowShareView>,
}

/// All groups with their share counts, newest first
pub fn list_cow_groups(conn: &Connection) -> LedgerResult<Vec<CowGroup>> {
    let mut stmt = conn.prepare(
        "SELECT cg.id, cg.created_at, COUNT(cs.donation_id)
         FROM cow_groups cg
         LEFT JOIN cow_shares cs ON cs.cow_group_id = cg.id
         GROUP BY cg.id
         ORDER BY cg.created_at DESC, cg.id DESC",
    )?;

    let groups = stmt
        .query_map([], |row| {
            Ok(CowGroup {
                id: row.get(0)?,
                created_at: db::timestamp_column(row, 1)?,
                share_count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(groups)
}

/// One group with each share's donation status and donor, in join order
pub fn get_cow_group(conn: &Connection, id: i64) -> LedgerResult<CowGroupDetail> {
    let created_at = conn
        .query_row(
            "SELECT created_at FROM cow_groups WHERE id = ?1",
            [id],
            |row| db::timestamp_column(row, 0),
        )
        .optional()?
        .ok_or_else(|| LedgerError::not_found("cow group", id))?;

    let mut stmt = conn.prepare(
        "SELECT d.id, d.status, dn.first_name, dn.last_name, dn.whatsapp_number
         FROM cow_shares cs
         JOIN donations d ON d.id = cs.donation_id
         JOIN donors dn ON dn.id = d.donor_id
         WHERE cs.cow_group_id = ?1
         ORDER BY d.created_at ASC, d.id ASC",
    )?;

    let shares = stmt
        .query_map([id], |row| {
            Ok(CowShareView {
                donation_id: row.get(0)?,
                status: row.get(1)?,
                donor: ShareDonor {
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    whatsapp_number: row.get(4)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CowGroupDetail {
        id,
        created_at,
        shares,
    })
}
