// Grouping Engine - packs cow donations into groups of seven
//
// Every cow donation joins the fullest group that still has room; a new
// group is opened only when every existing group is full. Callers run this
// inside the same write transaction that inserts the donation.

use tracing::{debug, warn};

use crate::error::LedgerResult;
use crate::store::DonationStore;

/// Shares in one cow
pub const COW_GROUP_CAPACITY: u32 = 7;

/// Placement attempts before a GroupFull rejection is handed to the caller
pub const PLACEMENT_ATTEMPTS: u32 = 3;

/// Place a cow donation and return the group it joined.
///
/// A `GroupFull` rejection (another writer filled the chosen group first)
/// re-reads the open groups and tries again, up to `PLACEMENT_ATTEMPTS`.
/// Any other error, including a duplicate share, is returned at once.
pub fn place_cow_donation<S>(store: &S, donation_id: i64) -> LedgerResult<i64>
where
    S: DonationStore + ?Sized,
{
    let mut attempt = 1;

    loop {
        let group_id = choose_group(store)?;

        match store.create_cow_share(donation_id, group_id) {
            Ok(()) => {
                debug!(donation_id, group_id, attempt, "cow share placed");
                return Ok(group_id);
            }
            Err(err) if err.is_group_full() && attempt < PLACEMENT_ATTEMPTS => {
                warn!(donation_id, group_id, attempt, "cow group filled concurrently, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fullest open group, or a fresh one when none has room
fn choose_group<S>(store: &S) -> LedgerResult<i64>
where
    S: DonationStore + ?Sized,
{
    match store.list_open_groups()?.first() {
        Some(open) => Ok(open.group_id),
        None => {
            let group_id = store.create_group()?;
            debug!(group_id, "opened new cow group");
            Ok(group_id)
        }
    }
}
