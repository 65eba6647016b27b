pub mod authz;
pub mod config;
pub mod config_loader;
pub mod currency;
pub mod error;
pub mod reconciliation;
pub mod records;
pub mod store;

pub use authz::{Permission, Principal, Role};
pub use config::{
    ApiToken, AppConfig, AuthConfig, CurrencyConfig, DatabaseConfig, MatchingConfig,
    ServerConfig, SweepConfig,
};
pub use config_loader::ConfigLoader;
pub use currency::{CurrencyTable, SETTLEMENT_CURRENCY};
pub use error::{ReconError, Result};
pub use reconciliation::{
    Confirmation, ReconDraft, ReconStatus, ReconciliationRecord, VersionRef,
};
pub use records::{
    AdSpendRecord, Direction, LedgerTransaction, Matchable, NewAdSpend, NewLedgerTransaction,
    RecordId, RecordKind, RecordStatus, MAX_AMOUNT, MAX_AMOUNT_SCALE,
};
pub use store::{
    AdSpendFilter, CandidateWindow, LedgerFilter, PageRequest, PendingQuery, RecordStore,
    ReconFilter,
};
