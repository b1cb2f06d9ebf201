//! Ledger model shared by the engine and the store backends: articles,
//! operations, balances, month periods and the `LedgerStore` trait.

pub mod models;
pub mod period;
pub mod storage;

pub use models::{
    Article, ArticleId, Balance, BalanceId, Operation, OperationId, ReportValue, Role, Totals,
    UserRecord,
};
pub use models::write::{BalanceLink, NewOperation, OperationFilter};
pub use models::read::{
    ArticleOperationRow, ArticleShare, ArticleTotals, BalanceOperationCount,
    BalanceProfitComparison, DateProfit, DateTotals, FlowKind, OperationProfit,
};
pub use period::{format_date, parse_date, period_of, DateRange, InvalidDate};
pub use storage::{LedgerStore, StorageError, TransactionId};
