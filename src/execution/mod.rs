// Position bookkeeping, order sizing and the per-cycle trading loop
pub mod coordinator;
pub mod ledger;
pub mod quantize;

pub use coordinator::{
    CapitalMode, Coordinator, CoordinatorSettings, CycleReport, ExitReason, PairSpec, PairState,
    StartupError, TradeError, TradeOutcome,
};
pub use ledger::{LedgerError, LedgerSnapshot, PositionLedger, PositionRecord, SyncOutcome};
pub use quantize::{decimal_places, floor_to_precision, format_quantity};
