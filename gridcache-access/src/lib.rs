//! gridcache Access - Strategies and Region Factory
//!
//! The ORM-facing side of the cache:
//!
//! - [`AccessDelegate`]: read-only, nonstrict read-write, read-write and
//!   transactional strategies over a [`RegionCache`](gridcache_storage::RegionCache)
//! - [`SessionContext`] and [`Transaction`]: caller identity and staged writes
//! - [`RegionFactory`]: builds regions and strategies, runs cleanup
//! - [`RegionStatus`]: memoized counters and local eviction per member

pub mod delegate;
pub mod factory;
pub mod nonstrict;
pub mod read_only;
pub mod read_write;
pub mod region;
pub mod session;
pub mod status;
pub mod transactional;

pub use delegate::AccessDelegate;
pub use factory::{RegionFactory, DEFAULT_QUERY_RESULTS_REGION, DEFAULT_TIMESTAMPS_REGION};
pub use nonstrict::NonStrictReadWriteAccess;
pub use read_only::ReadOnlyAccess;
pub use read_write::ReadWriteAccess;
pub use region::{build_access_delegate, DomainDataRegion, QueryResultsRegion};
pub use session::{
    CommitSummary, SessionContext, StagedRead, StagedWrite, Transaction, TransactionStatus,
};
pub use status::{RegionStatus, StatusReport};
pub use transactional::TransactionalAccess;
