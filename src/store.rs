// Persistence interface of the grouping engine and the distributor
//
// The engines only talk to a DonationStore. SqliteStore implements it over
// an open transaction, so every call made during one unit of work commits
// or rolls back together.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use std::collections::HashSet;

use crate::db::{self, Event};
use crate::entities::agent::Agent;
use crate::entities::donation::{DonationKind, DonationStatus};
use crate::error::{is_constraint_violation, LedgerError, LedgerResult, Violation};
use crate::grouping::COW_GROUP_CAPACITY;

// Keeps every statement well under SQLite's bound-parameter limit
const IDS_PER_STATEMENT: usize = 500;
const PAIRS_PER_STATEMENT: usize = 300;

/// A cow group that can still take shares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupOccupancy {
    pub group_id: i64,
    pub member_count: u32,
}

/// A full cow group whose members are all still pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompleteGroup {
    pub group_id: i64,
    pub donation_ids: Vec<i64>,
}

/// One row of the assignment table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AssignmentPair {
    pub agent_id: i64,
    pub donation_id: i64,
}

pub trait DonationStore {
    fn count_group_members(&self, group_id: i64) -> LedgerResult<u32>;

    /// Groups below capacity whose members are all still pending, fullest
    /// first (older group wins a tie). A group that lost a member after it
    /// went out for delivery is never reopened.
    fn list_open_groups(&self) -> LedgerResult<Vec<GroupOccupancy>>;

    fn create_group(&self) -> LedgerResult<i64>;

    /// Fails with `GroupFull` or `DuplicateShare` rather than breaking
    /// either invariant
    fn create_cow_share(&self, donation_id: i64, group_id: i64) -> LedgerResult<()>;

    /// Pending donations of one kind, oldest first
    fn list_pending_by_kind(&self, kind: DonationKind) -> LedgerResult<Vec<i64>>;

    /// Full groups with every member pending, oldest group first
    fn list_complete_pending_groups(&self) -> LedgerResult<Vec<CompleteGroup>>;

    fn clear_assignments(&self, donation_ids: &[i64]) -> LedgerResult<usize>;

    fn create_assignments(&self, pairs: &[AssignmentPair]) -> LedgerResult<usize>;

    /// Moves only the listed donations currently in `from`
    fn set_status(
        &self,
        donation_ids: &[i64],
        from: DonationStatus,
        to: DonationStatus,
    ) -> LedgerResult<usize>;

    fn create_agent(&self, name: &str) -> LedgerResult<Agent>;

    fn agent_exists(&self, agent_id: i64) -> LedgerResult<bool>;

    /// The subset of `donation_ids` that has no donation row, in input order
    fn missing_donations(&self, donation_ids: &[i64]) -> LedgerResult<Vec<i64>>;

    fn record_event(&self, event: &Event) -> LedgerResult<()>;
}

/// DonationStore over a connection that is inside a transaction
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteStore { conn }
    }

    /// Raw access for entity CRUD sharing the same transaction
    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    fn share_exists(&self, donation_id: i64) -> LedgerResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cow_shares WHERE donation_id = ?1",
            [donation_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl DonationStore for SqliteStore<'_> {
    fn count_group_members(&self, group_id: i64) -> LedgerResult<u32> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM cow_shares WHERE cow_group_id = ?1",
            [group_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_open_groups(&self) -> LedgerResult<Vec<GroupOccupancy>> {
        let mut stmt = self.conn.prepare(
            "SELECT cg.id, COUNT(cs.donation_id) AS members
             FROM cow_groups cg
             LEFT JOIN cow_shares cs ON cs.cow_group_id = cg.id
             LEFT JOIN donations d ON d.id = cs.donation_id
             GROUP BY cg.id
             HAVING COUNT(cs.donation_id) < ?1
                AND SUM(CASE WHEN d.status <> 'pending' THEN 1 ELSE 0 END) = 0
             ORDER BY members DESC, cg.created_at ASC, cg.id ASC",
        )?;

        let groups = stmt
            .query_map([COW_GROUP_CAPACITY], |row| {
                Ok(GroupOccupancy {
                    group_id: row.get(0)?,
                    member_count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(groups)
    }

    fn create_group(&self) -> LedgerResult<i64> {
        self.conn.execute(
            "INSERT INTO cow_groups (created_at) VALUES (?1)",
            [db::now_timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn create_cow_share(&self, donation_id: i64, group_id: i64) -> LedgerResult<()> {
        let inserted = self.conn.execute(
            "INSERT INTO cow_shares (donation_id, cow_group_id, created_at) VALUES (?1, ?2, ?3)",
            params![donation_id, group_id, db::now_timestamp()],
        );

        match inserted {
            Ok(_) => Ok(()),
            // The statement alone was aborted; probe which invariant held it back
            Err(e) if is_constraint_violation(&e) => {
                if self.share_exists(donation_id)? {
                    Err(LedgerError::ConstraintViolation(Violation::DuplicateShare {
                        donation_id,
                    }))
                } else if self.count_group_members(group_id)? >= COW_GROUP_CAPACITY {
                    Err(LedgerError::ConstraintViolation(Violation::GroupFull { group_id }))
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_pending_by_kind(&self, kind: DonationKind) -> LedgerResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM donations
             WHERE kind = ?1 AND status = ?2
             ORDER BY created_at ASC, id ASC",
        )?;

        let ids = stmt
            .query_map(params![kind, DonationStatus::Pending], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        Ok(ids)
    }

    fn list_complete_pending_groups(&self) -> LedgerResult<Vec<CompleteGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT cs.cow_group_id, cs.donation_id
             FROM cow_shares cs
             JOIN donations d ON d.id = cs.donation_id
             JOIN cow_groups cg ON cg.id = cs.cow_group_id
             WHERE cs.cow_group_id IN (
                 SELECT s.cow_group_id
                 FROM cow_shares s
                 JOIN donations m ON m.id = s.donation_id
                 GROUP BY s.cow_group_id
                 HAVING COUNT(*) = ?1
                    AND SUM(CASE WHEN m.status = 'pending' THEN 1 ELSE 0 END) = ?1
             )
             ORDER BY cg.created_at ASC, cg.id ASC, d.created_at ASC, d.id ASC",
        )?;

        let rows = stmt
            .query_map([COW_GROUP_CAPACITY], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: Vec<CompleteGroup> = Vec::new();
        for (group_id, donation_id) in rows {
            match groups.last_mut() {
                Some(group) if group.group_id == group_id => group.donation_ids.push(donation_id),
                _ => groups.push(CompleteGroup {
                    group_id,
                    donation_ids: vec![donation_id],
                }),
            }
        }

        Ok(groups)
    }

    fn clear_assignments(&self, donation_ids: &[i64]) -> LedgerResult<usize> {
        let mut removed = 0;
        for chunk in donation_ids.chunks(IDS_PER_STATEMENT) {
            let sql = format!(
                "DELETE FROM agent_donations WHERE donation_id IN ({})",
                placeholders(chunk.len())
            );
            removed += self.conn.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        Ok(removed)
    }

    fn create_assignments(&self, pairs: &[AssignmentPair]) -> LedgerResult<usize> {
        let assigned_at = db::now_timestamp();
        let mut inserted = 0;

        for chunk in pairs.chunks(PAIRS_PER_STATEMENT) {
            let rows = vec!["(?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO agent_donations (agent_id, donation_id, assigned_at) VALUES {}",
                rows
            );

            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 3);
            for pair in chunk {
                values.push(Value::Integer(pair.agent_id));
                values.push(Value::Integer(pair.donation_id));
                values.push(Value::Text(assigned_at.clone()));
            }

            inserted += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }

        Ok(inserted)
    }

    fn set_status(
        &self,
        donation_ids: &[i64],
        from: DonationStatus,
        to: DonationStatus,
    ) -> LedgerResult<usize> {
        let stamp = db::now_timestamp();
        let mut updated = 0;

        for chunk in donation_ids.chunks(IDS_PER_STATEMENT) {
            let sql = format!(
                "UPDATE donations
                 SET status = ?,
                     completed_at = CASE WHEN ? = 'done' THEN ? ELSE completed_at END
                 WHERE status = ? AND id IN ({})",
                placeholders(chunk.len())
            );

            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() + 4);
            values.push(Value::Text(to.as_str().to_string()));
            values.push(Value::Text(to.as_str().to_string()));
            values.push(Value::Text(stamp.clone()));
            values.push(Value::Text(from.as_str().to_string()));
            values.extend(chunk.iter().map(|id| Value::Integer(*id)));

            updated += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }

        Ok(updated)
    }

    fn create_agent(&self, name: &str) -> LedgerResult<Agent> {
        let created_at = db::now();
        self.conn.execute(
            "INSERT INTO agents (agent_name, created_at) VALUES (?1, ?2)",
            params![name, db::format_timestamp(created_at)],
        )?;

        Ok(Agent {
            id: self.conn.last_insert_rowid(),
            agent_name: name.to_string(),
            created_at,
        })
    }

    fn agent_exists(&self, agent_id: i64) -> LedgerResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE id = ?1",
            [agent_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn missing_donations(&self, donation_ids: &[i64]) -> LedgerResult<Vec<i64>> {
        let mut found: HashSet<i64> = HashSet::with_capacity(donation_ids.len());

        for chunk in donation_ids.chunks(IDS_PER_STATEMENT) {
            let sql = format!(
                "SELECT id FROM donations WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            found.extend(ids);
        }

        Ok(donation_ids
            .iter()
            .copied()
            .filter(|id| !found.contains(id))
            .collect())
    }

    fn record_event(&self, event: &Event) -> LedgerResult<()> {
        db::insert_event(self.conn, event)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn seed_donation(conn: &Connection, kind: DonationKind) -> i64 {
        conn.execute(
            "INSERT OR IGNORE INTO donors (id, first_name, last_name, whatsapp_number, created_at)
             VALUES (1, 'Omar', 'Saidi', '+21650000000', ?1)",
            [db::now_timestamp()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO donations (donor_id, price, kind, status, created_at)
             VALUES (1, 100.0, ?1, 'pending', ?2)",
            params![kind, db::now_timestamp()],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_capacity_trigger_reports_group_full() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let group = store.create_group()?;
            for _ in 0..COW_GROUP_CAPACITY {
                let id = seed_donation(store.conn(), DonationKind::Cow);
                store.create_cow_share(id, group)?;
            }
            assert_eq!(store.count_group_members(group)?, COW_GROUP_CAPACITY);
            assert!(store.list_open_groups()?.is_empty());

            let eighth = seed_donation(store.conn(), DonationKind::Cow);
            let err = store.create_cow_share(eighth, group).unwrap_err();
            assert!(err.is_group_full());
            assert_eq!(store.count_group_members(group)?, COW_GROUP_CAPACITY);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let first = store.create_group()?;
            let second = store.create_group()?;
            let id = seed_donation(store.conn(), DonationKind::Cow);

            store.create_cow_share(id, first)?;
            let err = store.create_cow_share(id, second).unwrap_err();
            assert!(matches!(
                err,
                LedgerError::ConstraintViolation(Violation::DuplicateShare { donation_id }) if donation_id == id
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_groups_fullest_first() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let small = store.create_group()?;
            let large = store.create_group()?;
            let empty = store.create_group()?;
            for (group, members) in [(small, 2), (large, 5)] {
                for _ in 0..members {
                    let id = seed_donation(store.conn(), DonationKind::Cow);
                    store.create_cow_share(id, group)?;
                }
            }

            let open = store.list_open_groups()?;
            let order: Vec<(i64, u32)> = open.iter().map(|g| (g.group_id, g.member_count)).collect();
            assert_eq!(order, vec![(large, 5), (small, 2), (empty, 0)]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_groups_skip_groups_already_sent() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let sent = store.create_group()?;
            let fresh = store.create_group()?;
            let mut members = Vec::new();
            for _ in 0..3 {
                let id = seed_donation(store.conn(), DonationKind::Cow);
                store.create_cow_share(id, sent)?;
                members.push(id);
            }
            let id = seed_donation(store.conn(), DonationKind::Cow);
            store.create_cow_share(id, fresh)?;

            store.set_status(&members[..1], DonationStatus::Pending, DonationStatus::Sending)?;

            let open: Vec<i64> = store.list_open_groups()?.iter().map(|g| g.group_id).collect();
            assert_eq!(open, vec![fresh]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_bulk_statements_span_chunks() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let agent = store.create_agent("Bulk")?;
            let ids: Vec<i64> = (0..(PAIRS_PER_STATEMENT + 25))
                .map(|_| seed_donation(store.conn(), DonationKind::Sheep))
                .collect();
            let pairs: Vec<AssignmentPair> = ids
                .iter()
                .map(|&donation_id| AssignmentPair {
                    agent_id: agent.id,
                    donation_id,
                })
                .collect();

            assert_eq!(store.create_assignments(&pairs)?, ids.len());
            assert_eq!(
                store.set_status(&ids, DonationStatus::Pending, DonationStatus::Sending)?,
                ids.len()
            );
            // guarded: nothing is pending any more
            assert_eq!(
                store.set_status(&ids, DonationStatus::Pending, DonationStatus::Sending)?,
                0
            );
            assert_eq!(store.clear_assignments(&ids)?, ids.len());
            assert!(store.list_pending_by_kind(DonationKind::Sheep)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_missing_donations_preserves_order() {
        let db = Database::open_in_memory().unwrap();

        db.transaction(|store| {
            let known = seed_donation(store.conn(), DonationKind::Sheep);
            let missing = store.missing_donations(&[404, known, 405])?;
            assert_eq!(missing, vec![404, 405]);
            assert!(!store.agent_exists(1)?);
            Ok(())
        })
        .unwrap();
    }
}
