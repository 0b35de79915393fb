// Agent entity - a field worker who carries out donations
//
// Agents are created by hand or, one per name, by every split.
// Their workload is whatever the assignment table points at them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, Database};
use crate::entities::donation::{detail_from_row, DonationDetail};
use crate::error::{LedgerError, LedgerResult};
use crate::store::DonationStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
}

/// Agent with progress over their assigned donations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub agent: Agent,
    pub total_donations: i64,
    pub completed_donations: i64,
    /// Assigned but not yet done (pending or sending)
    pub pending_donations: i64,
    /// Rounded percentage of assigned donations that are done
    pub completion_percentage: i64,
    pub sheep_count: i64,
    pub cow_count: i64,
}

/// Request body for creating or renaming an agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentName {
    pub agent_name: String,
}

/// One cow group as seen by an agent: every member, not only the ones
/// assigned to them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CowGroupWork {
    pub cow_group_id: i64,
    pub donations: Vec<DonationDetail>,
}

/// Everything an agent has to deliver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentWorkload {
    pub sheep_donations: Vec<DonationDetail>,
    pub cow_groups: Vec<CowGroupWork>,
}

pub(crate) fn validate_agent_name(name: &str) -> LedgerResult<()> {
    if name.trim().is_empty() {
        return Err(LedgerError::validation("agent name is required"));
    }
    Ok(())
}

pub(crate) fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        created_at: db::timestamp_column(row, 2)?,
    })
}

const SUMMARY_SELECT: &str = "SELECT a.id, a.agent_name, a.created_at,
            COUNT(d.id),
            COALESCE(SUM(CASE WHEN d.status = 'done' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN d.status IN ('pending', 'sending') THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN d.kind = 'sheep' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN d.kind = 'cow' THEN 1 ELSE 0 END), 0)
     FROM agents a
     LEFT JOIN agent_donations ad ON ad.agent_id = a.id
     LEFT JOIN donations d ON d.id = ad.donation_id";

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<AgentSummary> {
    let total: i64 = row.get(3)?;
    let completed: i64 = row.get(4)?;

    Ok(AgentSummary {
        agent: agent_from_row(row)?,
        total_donations: total,
        completed_donations: completed,
        pending_donations: row.get(5)?,
        completion_percentage: completion_percentage(completed, total),
        sheep_count: row.get(6)?,
        cow_count: row.get(7)?,
    })
}

fn completion_percentage(completed: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as i64
}

pub fn create_agent(db: &Database, name: &str) -> LedgerResult<Agent> {
    validate_agent_name(name)?;
    let agent = db.transaction(|store| store.create_agent(name.trim()))?;
    info!(agent_id = agent.id, agent_name = %agent.agent_name, "agent created");
    Ok(agent)
}

pub fn get_agent(conn: &Connection, id: i64) -> LedgerResult<AgentSummary> {
    conn.query_row(
        &format!("{} WHERE a.id = ?1 GROUP BY a.id", SUMMARY_SELECT),
        [id],
        summary_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("agent", id))
}

/// All agents, busiest first, then newest first
pub fn list_agents(conn: &Connection) -> LedgerResult<Vec<AgentSummary>> {
    let mut stmt = conn.prepare(&format!(
        "{} GROUP BY a.id ORDER BY 6 DESC, a.created_at DESC, a.id DESC",
        SUMMARY_SELECT
    ))?;
    let agents = stmt
        .query_map([], summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(agents)
}

pub fn rename_agent(db: &Database, id: i64, name: &str) -> LedgerResult<Agent> {
    validate_agent_name(name)?;

    db.transaction(|store| {
        let conn = store.conn();
        let changed = conn.execute(
            "UPDATE agents SET agent_name = ?1 WHERE id = ?2",
            params![name.trim(), id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("agent", id));
        }
        let agent = conn.query_row(
            "SELECT id, agent_name, created_at FROM agents WHERE id = ?1",
            [id],
            agent_from_row,
        )?;
        Ok(agent)
    })
}

/// Delete an agent; their assignments go with them, the donations stay
pub fn delete_agent(db: &Database, id: i64) -> LedgerResult<()> {
    db.transaction(|store| {
        let removed = store.conn().execute("DELETE FROM agents WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(LedgerError::not_found("agent", id));
        }
        Ok(())
    })
}

/// Sheep assigned to the agent plus every cow group that has at least one
/// member assigned to them (listed with all of its members)
pub fn agent_workload(conn: &Connection, agent_id: i64) -> LedgerResult<AgentWorkload> {
    let exists = conn
        .query_row("SELECT 1 FROM agents WHERE id = ?1", [agent_id], |_| Ok(()))
        .optional()?;
    if exists.is_none() {
        return Err(LedgerError::not_found("agent", agent_id));
    }

    let mut sheep_stmt = conn.prepare(
        "SELECT d.id, d.donor_id, d.price, d.kind, d.status, d.created_at,
                d.completed_at, NULL,
                dn.first_name, dn.last_name, dn.whatsapp_number
         FROM agent_donations ad
         JOIN donations d ON d.id = ad.donation_id
         JOIN donors dn ON dn.id = d.donor_id
         WHERE ad.agent_id = ?1 AND d.kind = 'sheep'
         ORDER BY d.created_at ASC, d.id ASC",
    )?;
    let sheep_donations = sheep_stmt
        .query_map([agent_id], detail_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cow_stmt = conn.prepare(
        "SELECT d.id, d.donor_id, d.price, d.kind, d.status, d.created_at,
                d.completed_at, cs.cow_group_id,
                dn.first_name, dn.last_name, dn.whatsapp_number
         FROM cow_shares cs
         JOIN donations d ON d.id = cs.donation_id
         JOIN donors dn ON dn.id = d.donor_id
         WHERE cs.cow_group_id IN (
             SELECT DISTINCT s.cow_group_id
             FROM agent_donations ad
             JOIN cow_shares s ON s.donation_id = ad.donation_id
             WHERE ad.agent_id = ?1
         )
         ORDER BY cs.cow_group_id ASC, d.created_at ASC, d.id ASC",
    )?;
    let members = cow_stmt
        .query_map([agent_id], detail_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cow_groups: Vec<CowGroupWork> = Vec::new();
    for member in members {
        let group_id = member.donation.cow_group_id.unwrap_or_default();
        match cow_groups.last_mut() {
            Some(group) if group.cow_group_id == group_id => group.donations.push(member),
            _ => cow_groups.push(CowGroupWork {
                cow_group_id: group_id,
                donations: vec![member],
            }),
        }
    }

    Ok(AgentWorkload {
        sheep_donations,
        cow_groups,
    })
}
