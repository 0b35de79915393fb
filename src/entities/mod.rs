// Entity records and their CRUD
//
// Each entity owns its table layout, row mapping, and the thin
// read/write operations the API and CLI call. Group placement and
// assignment rules live in `grouping` and `distributor`.

pub mod agent;
pub mod cow_group;
pub mod donation;
pub mod donor;

pub use agent::{Agent, AgentName, AgentSummary, AgentWorkload, CowGroupWork};
pub use cow_group::{CowGroup, CowGroupDetail, CowShareView, ShareDonor};
pub use donation::{
    DashboardCounts, Donation, DonationDetail, DonationKind, DonationStatus, NewDonation,
};
pub use donor::{Donor, DonorSummary, NewDonor};
