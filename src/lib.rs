// Udhiya Ledger - Core Library
// Donor, donation, cow-group and agent bookkeeping shared by the CLI,
// the API server, and tests

pub mod config;
pub mod db;
pub mod distributor;
pub mod entities;
pub mod error;
pub mod grouping;
pub mod store;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::{Config, ServerConfig};
pub use db::{get_events_for_entity, insert_event, setup_database, Database, Event};
pub use distributor::{
    assign_donations_to_agent, contiguous_slices, split_pending, AgentAllocation, SplitOutcome,
};
pub use entities::{
    Agent, AgentSummary, AgentWorkload, CowGroup, CowGroupDetail, DashboardCounts, Donation,
    DonationDetail, DonationKind, DonationStatus, Donor, DonorSummary, NewDonation, NewDonor,
};
pub use error::{LedgerError, LedgerResult, Violation};
pub use grouping::{place_cow_donation, COW_GROUP_CAPACITY};
pub use store::{AssignmentPair, CompleteGroup, DonationStore, GroupOccupancy, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
