// Assignment Distributor - splits the pending pool across agents
//
// Two pools are split independently with the same contiguous-slice rule:
// loose sheep donations, and complete cow groups (seven pending members).
// A cow group always travels whole. Prior assignments of every pooled
// donation are cleared first, and everything assigned moves from pending
// to sending, all inside one transaction.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::db::{Database, Event};
use crate::entities::agent::{validate_agent_name, Agent};
use crate::entities::donation::{DonationKind, DonationStatus};
use crate::error::{LedgerError, LedgerResult};
use crate::store::{AssignmentPair, DonationStore};

/// What one agent received from a split
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentAllocation {
    pub agent_id: i64,
    pub sheep_donation_ids: Vec<i64>,
    pub cow_group_ids: Vec<i64>,
    /// Every donation assigned to the agent, group members included
    pub donation_count: usize,
}

/// Result of a split
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutcome {
    pub agents: Vec<Agent>,
    pub allocations: Vec<AgentAllocation>,
    pub sheep_count: usize,
    pub cow_groups_count: usize,
}

/// Cut `items` into `parts` contiguous slices of `ceil(len / parts)`.
///
/// Always returns exactly `parts` slices, in order; trailing slices may be
/// short or empty (10 items over 3 parts gives 4, 4, 2).
pub fn contiguous_slices<T>(items: &[T], parts: usize) -> Vec<&[T]> {
    if parts == 0 {
        return Vec::new();
    }

    let per_part = items.len().div_ceil(parts);
    (0..parts)
        .map(|i| {
            let start = (i * per_part).min(items.len());
            let end = (start + per_part).min(items.len());
            &items[start..end]
        })
        .collect()
}

/// Create one agent per name and split the pending pool between them
pub fn split_pending(db: &Database, agent_names: &[String]) -> LedgerResult<SplitOutcome> {
    validate_names(agent_names)?;

    let outcome = db.transaction(|store| split_pending_in(store, agent_names))?;

    info!(
        agents = outcome.agents.len(),
        sheep = outcome.sheep_count,
        cow_groups = outcome.cow_groups_count,
        "pending donations split"
    );
    Ok(outcome)
}

/// Split body; the caller owns the transaction
pub fn split_pending_in<S>(store: &S, agent_names: &[String]) -> LedgerResult<SplitOutcome>
where
    S: DonationStore + ?Sized,
{
    validate_names(agent_names)?;

    // A fresh agent per name, never a lookup; input order is split order
    let agents = agent_names
        .iter()
        .map(|name| store.create_agent(name.trim()))
        .collect::<LedgerResult<Vec<Agent>>>()?;

    let sheep = store.list_pending_by_kind(DonationKind::Sheep)?;
    let groups = store.list_complete_pending_groups()?;

    let pooled: Vec<i64> = sheep
        .iter()
        .copied()
        .chain(groups.iter().flat_map(|g| g.donation_ids.iter().copied()))
        .collect();

    let cleared = store.clear_assignments(&pooled)?;

    let sheep_slices = contiguous_slices(&sheep, agents.len());
    let group_slices = contiguous_slices(&groups, agents.len());

    let mut pairs: Vec<AssignmentPair> = Vec::with_capacity(pooled.len());
    let mut allocations = Vec::with_capacity(agents.len());

    for ((agent, sheep_part), group_part) in agents.iter().zip(sheep_slices).zip(group_slices) {
        let before = pairs.len();

        pairs.extend(sheep_part.iter().map(|&donation_id| AssignmentPair {
            agent_id: agent.id,
            donation_id,
        }));
        for group in group_part {
            pairs.extend(group.donation_ids.iter().map(|&donation_id| AssignmentPair {
                agent_id: agent.id,
                donation_id,
            }));
        }

        debug!(
            agent_id = agent.id,
            sheep = sheep_part.len(),
            cow_groups = group_part.len(),
            "allocation computed"
        );

        allocations.push(AgentAllocation {
            agent_id: agent.id,
            sheep_donation_ids: sheep_part.to_vec(),
            cow_group_ids: group_part.iter().map(|g| g.group_id).collect(),
            donation_count: pairs.len() - before,
        });
    }

    store.create_assignments(&pairs)?;
    let moved = store.set_status(&pooled, DonationStatus::Pending, DonationStatus::Sending)?;

    store.record_event(&Event::new(
        "donations_split",
        "split",
        agents.first().map(|a| a.id).unwrap_or_default(),
        serde_json::json!({
            "agent_ids": agents.iter().map(|a| a.id).collect::<Vec<_>>(),
            "sheep_count": sheep.len(),
            "cow_groups_count": groups.len(),
            "cleared_assignments": cleared,
            "moved_to_sending": moved,
        }),
    ))?;

    Ok(SplitOutcome {
        agents,
        allocations,
        sheep_count: sheep.len(),
        cow_groups_count: groups.len(),
    })
}

/// Hand an explicit set of donations to one existing agent.
///
/// Prior assignments of those donations are replaced and pending ones move
/// to sending. No cow-group completeness check is made here.
pub fn assign_donations_to_agent(
    db: &Database,
    agent_id: i64,
    donation_ids: &[i64],
) -> LedgerResult<Vec<AssignmentPair>> {
    let pairs = db.transaction(|store| assign_donations_in(store, agent_id, donation_ids))?;
    info!(agent_id, donations = pairs.len(), "donations assigned");
    Ok(pairs)
}

pub fn assign_donations_in<S>(
    store: &S,
    agent_id: i64,
    donation_ids: &[i64],
) -> LedgerResult<Vec<AssignmentPair>>
where
    S: DonationStore + ?Sized,
{
    if donation_ids.is_empty() {
        return Err(LedgerError::validation("donation_ids must be a non-empty array"));
    }
    if !store.agent_exists(agent_id)? {
        return Err(LedgerError::not_found("agent", agent_id));
    }

    let mut seen: HashSet<i64> = HashSet::with_capacity(donation_ids.len());
    let unique: Vec<i64> = donation_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();

    if let Some(&missing) = store.missing_donations(&unique)?.first() {
        return Err(LedgerError::not_found("donation", missing));
    }

    store.clear_assignments(&unique)?;

    let pairs: Vec<AssignmentPair> = unique
        .iter()
        .map(|&donation_id| AssignmentPair {
            agent_id,
            donation_id,
        })
        .collect();
    store.create_assignments(&pairs)?;
    store.set_status(&unique, DonationStatus::Pending, DonationStatus::Sending)?;

    store.record_event(&Event::new(
        "donations_assigned",
        "agent",
        agent_id,
        serde_json::json!({ "donation_ids": unique }),
    ))?;

    Ok(pairs)
}

fn validate_names(agent_names: &[String]) -> LedgerResult<()> {
    if agent_names.is_empty() {
        return Err(LedgerError::validation("agent_names must be a non-empty array"));
    }
    agent_names.iter().try_for_each(|name| validate_agent_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_events_for_entity;
    use crate::entities::agent::{agent_workload, get_agent};
    use crate::entities::donation::{
        create_donation, delete_donation, update_status, Donation, NewDonation,
    };
    use crate::entities::donor::{create_donor, NewDonor};
    use crate::store::testing::FaultyStore;
    use rusqlite::Connection;
    use std::collections::HashMap;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let donor = create_donor(
            &db,
            &NewDonor {
                first_name: "Fatima".to_string(),
                last_name: "Zahra".to_string(),
                whatsapp_number: "+212633333333".to_string(),
            },
        )
        .unwrap();
        (db, donor.id)
    }

    fn donate(db: &Database, donor_id: i64, kind: DonationKind, count: usize) -> Vec<Donation> {
        (0..count)
            .map(|_| {
                create_donation(
                    db,
                    &NewDonation {
                        donor_id,
                        price: 200.0,
                        kind,
                    },
                )
                .unwrap()
            })
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// donation id -> agent id for every assignment row
    fn assignments(conn: &Connection) -> LedgerResult<HashMap<i64, i64>> {
        let mut stmt = conn.prepare("SELECT donation_id, agent_id FROM agent_donations")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<i64, i64>, _>>()?;
        Ok(rows)
    }

    fn status_of(conn: &Connection, id: i64) -> LedgerResult<DonationStatus> {
        Ok(conn.query_row("SELECT status FROM donations WHERE id = ?1", [id], |r| r.get(0))?)
    }

    #[test]
    fn test_contiguous_slices() {
        let items: Vec<u32> = (0..10).collect();
        let sizes: Vec<usize> = contiguous_slices(&items, 3).iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let sizes: Vec<usize> = contiguous_slices(&items[..5], 4).iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1, 0]);

        let empty: [u32; 0] = [];
        assert_eq!(contiguous_slices(&empty, 2), vec![&empty[..], &empty[..]]);
        assert!(contiguous_slices(&items, 0).is_empty());

        let parts = contiguous_slices(&items, 3);
        assert_eq!(parts[0], &[0, 1, 2, 3]);
        assert_eq!(parts[2], &[8, 9]);
    }

    #[test]
    fn test_slices_cover_every_item_once() {
        for len in 0..40usize {
            for parts in 1..9usize {
                let items: Vec<usize> = (0..len).collect();
                let slices = contiguous_slices(&items, parts);
                assert_eq!(slices.len(), parts);

                let ceil = len.div_ceil(parts);
                assert!(slices.iter().all(|s| s.len() <= ceil));
                let joined: Vec<usize> = slices.concat();
                assert_eq!(joined, items);
            }
        }
    }

    #[test]
    fn test_fifteen_sheep_two_agents() {
        let (db, donor_id) = setup();
        let sheep = donate(&db, donor_id, DonationKind::Sheep, 15);

        let outcome = split_pending(&db, &names(&["A", "B"])).unwrap();
        assert_eq!(outcome.sheep_count, 15);
        assert_eq!(outcome.cow_groups_count, 0);
        assert_eq!(outcome.agents[0].agent_name, "A");
        assert_eq!(outcome.agents[1].agent_name, "B");

        let ids: Vec<i64> = sheep.iter().map(|d| d.id).collect();
        assert_eq!(outcome.allocations[0].sheep_donation_ids, ids[..8].to_vec());
        assert_eq!(outcome.allocations[1].sheep_donation_ids, ids[8..].to_vec());

        let (a, b) = (outcome.agents[0].id, outcome.agents[1].id);
        let rows = db.read(assignments).unwrap();
        assert_eq!(rows.len(), 15);
        assert!(ids[..8].iter().all(|id| rows[id] == a));
        assert!(ids[8..].iter().all(|id| rows[id] == b));

        for id in &ids {
            assert_eq!(db.read(|c| status_of(c, *id)).unwrap(), DonationStatus::Sending);
        }
    }

    #[test]
    fn test_cow_groups_travel_whole() {
        let (db, donor_id) = setup();
        let cows = donate(&db, donor_id, DonationKind::Cow, 21);
        donate(&db, donor_id, DonationKind::Sheep, 4);

        let outcome = split_pending(&db, &names(&["North", "South"])).unwrap();
        assert_eq!(outcome.cow_groups_count, 3);
        assert_eq!(outcome.sheep_count, 4);

        // ceil(3 / 2) = 2 groups for the first agent, 1 for the second
        assert_eq!(outcome.allocations[0].cow_group_ids.len(), 2);
        assert_eq!(outcome.allocations[1].cow_group_ids.len(), 1);
        assert_eq!(outcome.allocations[0].donation_count, 2 + 14);
        assert_eq!(outcome.allocations[1].donation_count, 2 + 7);

        let rows = db.read(assignments).unwrap();
        let mut owner_of_group: HashMap<i64, i64> = HashMap::new();
        for cow in &cows {
            let group = cow.cow_group_id.unwrap();
            let agent = rows[&cow.id];
            assert_eq!(*owner_of_group.entry(group).or_insert(agent), agent);
        }

        let north = outcome.agents[0].id;
        let workload = db.read(|conn| agent_workload(conn, north)).unwrap();
        assert_eq!(workload.sheep_donations.len(), 2);
        assert_eq!(workload.cow_groups.len(), 2);
        assert!(workload.cow_groups.iter().all(|g| g.donations.len() == 7));

        let summary = db.read(|conn| get_agent(conn, north)).unwrap();
        assert_eq!(summary.total_donations, 16);
        assert_eq!(summary.sheep_count, 2);
        assert_eq!(summary.cow_count, 14);
        assert_eq!(summary.pending_donations, 16);
    }

    #[test]
    fn test_incomplete_and_partly_sent_groups_stay_behind() {
        let (db, donor_id) = setup();
        let full = donate(&db, donor_id, DonationKind::Cow, 7);
        let partial = donate(&db, donor_id, DonationKind::Cow, 3);

        // one member of the full group is already on its way
        update_status(&db, full[0].id, DonationStatus::Sending).unwrap();

        let outcome = split_pending(&db, &names(&["Solo"])).unwrap();
        assert_eq!(outcome.cow_groups_count, 0);
        assert_eq!(outcome.sheep_count, 0);

        let rows = db.read(assignments).unwrap();
        assert!(rows.is_empty());
        for d in full[1..].iter().chain(partial.iter()) {
            assert_eq!(db.read(|c| status_of(c, d.id)).unwrap(), DonationStatus::Pending);
        }
    }

    #[test]
    fn test_untouched_outside_pool() {
        let (db, donor_id) = setup();
        let pooled = donate(&db, donor_id, DonationKind::Sheep, 3);
        let done = donate(&db, donor_id, DonationKind::Sheep, 1).remove(0);
        update_status(&db, done.id, DonationStatus::Done).unwrap();

        split_pending(&db, &names(&["Only"])).unwrap();

        let rows = db.read(assignments).unwrap();
        assert!(!rows.contains_key(&done.id));
        assert_eq!(db.read(|c| status_of(c, done.id)).unwrap(), DonationStatus::Done);
        assert!(pooled.iter().all(|d| rows.contains_key(&d.id)));
    }

    #[test]
    fn test_second_split_replaces_assignments() {
        let (db, donor_id) = setup();
        donate(&db, donor_id, DonationKind::Sheep, 5);
        donate(&db, donor_id, DonationKind::Cow, 7);

        let first = split_pending(&db, &names(&["A", "B"])).unwrap();

        // put the same pool back to pending, assignments still in place
        db.read(|conn| Ok(conn.execute("UPDATE donations SET status = 'pending'", [])?))
            .unwrap();

        let second = split_pending(&db, &names(&["A", "B"])).unwrap();
        assert_eq!(second.sheep_count, first.sheep_count);
        assert_eq!(second.cow_groups_count, first.cow_groups_count);

        // fresh agents each time
        assert_ne!(first.agents[0].id, second.agents[0].id);

        let rows = db.read(assignments).unwrap();
        assert_eq!(rows.len(), 12);
        let second_ids: Vec<i64> = second.agents.iter().map(|a| a.id).collect();
        assert!(rows.values().all(|agent| second_ids.contains(agent)));
    }

    #[test]
    fn test_late_cow_skips_group_that_lost_a_member() {
        let (db, donor_id) = setup();
        let cows = donate(&db, donor_id, DonationKind::Cow, 7);
        let sent_group = cows[0].cow_group_id.unwrap();

        split_pending(&db, &names(&["A"])).unwrap();
        delete_donation(&db, cows[0].id).unwrap();

        let late = donate(&db, donor_id, DonationKind::Cow, 1).remove(0);
        let late_group = late.cow_group_id.unwrap();
        assert_ne!(late_group, sent_group);

        let rest = donate(&db, donor_id, DonationKind::Cow, 6);
        assert!(rest.iter().all(|d| d.cow_group_id == Some(late_group)));

        let outcome = split_pending(&db, &names(&["B"])).unwrap();
        assert_eq!(outcome.cow_groups_count, 1);
        assert_eq!(outcome.allocations[0].cow_group_ids, vec![late_group]);

        let rows = db.read(assignments).unwrap();
        assert_eq!(rows[&late.id], outcome.agents[0].id);
        assert_eq!(db.read(|c| status_of(c, late.id)).unwrap(), DonationStatus::Sending);
    }

    #[test]
    fn test_split_validation() {
        let (db, donor_id) = setup();
        donate(&db, donor_id, DonationKind::Sheep, 2);

        assert!(matches!(split_pending(&db, &[]), Err(LedgerError::Validation(_))));
        assert!(matches!(
            split_pending(&db, &names(&["A", " "])),
            Err(LedgerError::Validation(_))
        ));

        let agents: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(agents, 0);
    }

    #[test]
    fn test_more_agents_than_work() {
        let (db, donor_id) = setup();
        donate(&db, donor_id, DonationKind::Sheep, 2);

        let outcome = split_pending(&db, &names(&["A", "B", "C"])).unwrap();
        let counts: Vec<usize> = outcome
            .allocations
            .iter()
            .map(|a| a.sheep_donation_ids.len())
            .collect();
        assert_eq!(counts, vec![1, 1, 0]);
        assert_eq!(outcome.agents.len(), 3);
    }

    #[test]
    fn test_failed_split_rolls_back_everything() {
        let (db, donor_id) = setup();
        let sheep = donate(&db, donor_id, DonationKind::Sheep, 4);

        let err = db
            .transaction(|store| {
                let mut faulty = FaultyStore::new(store);
                faulty.fail_set_status = true;
                split_pending_in(&faulty, &names(&["A", "B"]))
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransientStore(_)));

        let agents: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(agents, 0);
        assert!(db.read(assignments).unwrap().is_empty());
        for d in &sheep {
            assert_eq!(db.read(|c| status_of(c, d.id)).unwrap(), DonationStatus::Pending);
        }
    }

    #[test]
    fn test_split_is_audited() {
        let (db, donor_id) = setup();
        donate(&db, donor_id, DonationKind::Sheep, 3);

        let outcome = split_pending(&db, &names(&["A"])).unwrap();
        let events = db
            .read(|conn| get_events_for_entity(conn, "split", &outcome.agents[0].id.to_string()))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["sheep_count"], 3);
        assert_eq!(events[0].data["moved_to_sending"], 3);
    }

    #[test]
    fn test_assign_to_single_agent() {
        let (db, donor_id) = setup();
        let sheep = donate(&db, donor_id, DonationKind::Sheep, 3);
        let first = crate::entities::agent::create_agent(&db, "First").unwrap();
        let second = crate::entities::agent::create_agent(&db, "Second").unwrap();

        let ids: Vec<i64> = sheep.iter().map(|d| d.id).collect();
        assign_donations_to_agent(&db, first.id, &ids).unwrap();

        // re-assigning replaces, duplicates in the request collapse
        let pairs =
            assign_donations_to_agent(&db, second.id, &[ids[0], ids[0], ids[1]]).unwrap();
        assert_eq!(pairs.len(), 2);

        let rows = db.read(assignments).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[&ids[0]], second.id);
        assert_eq!(rows[&ids[1]], second.id);
        assert_eq!(rows[&ids[2]], first.id);
        assert!(ids
            .iter()
            .all(|id| db.read(|c| status_of(c, *id)).unwrap() == DonationStatus::Sending));
    }

    #[test]
    fn test_assign_keeps_first_occurrence_order() {
        let (db, donor_id) = setup();
        let ids: Vec<i64> = donate(&db, donor_id, DonationKind::Sheep, 3)
            .iter()
            .map(|d| d.id)
            .collect();
        let agent = crate::entities::agent::create_agent(&db, "Order").unwrap();

        let request = [ids[2], ids[0], ids[2], ids[1], ids[0], ids[1]];
        let pairs = assign_donations_to_agent(&db, agent.id, &request).unwrap();
        let assigned: Vec<i64> = pairs.iter().map(|p| p.donation_id).collect();
        assert_eq!(assigned, vec![ids[2], ids[0], ids[1]]);
    }

    #[test]
    fn test_assign_validation_and_not_found() {
        let (db, donor_id) = setup();
        let sheep = donate(&db, donor_id, DonationKind::Sheep, 1);
        let agent = crate::entities::agent::create_agent(&db, "Field").unwrap();

        assert!(matches!(
            assign_donations_to_agent(&db, agent.id, &[]),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            assign_donations_to_agent(&db, 999, &[sheep[0].id]),
            Err(LedgerError::NotFound { entity: "agent", id: 999 })
        ));
        assert!(matches!(
            assign_donations_to_agent(&db, agent.id, &[sheep[0].id, 4242]),
            Err(LedgerError::NotFound { entity: "donation", id: 4242 })
        ));

        // nothing half-applied
        assert!(db.read(assignments).unwrap().is_empty());
        assert_eq!(
            db.read(|c| status_of(c, sheep[0].id)).unwrap(),
            DonationStatus::Pending
        );
    }
}
