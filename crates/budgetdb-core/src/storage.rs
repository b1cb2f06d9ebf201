use rust_decimal::Decimal;
use time::Date;

use crate::models::{
    write::{NewOperation, OperationFilter},
    Article, ArticleId, Balance, BalanceId, Operation, OperationId, Totals, UserRecord,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// Persistent tables for articles, operations, balances and users.
///
/// Implementations only move rows in and out; aggregation and the balance
/// invariants live above this trait. Statements issued between
/// `begin_transaction` and `commit_transaction` are applied atomically.
pub trait LedgerStore: Send + Sync {
    // Articles
    fn insert_article(&self, name: &str) -> Result<Article, StorageError>;
    fn rename_article(&self, old_name: &str, new_name: &str) -> Result<(), StorageError>;
    /// Deletes the article together with its operations.
    fn delete_article(&self, id: ArticleId) -> Result<(), StorageError>;
    fn find_article(&self, name: &str) -> Result<Option<Article>, StorageError>;
    fn list_articles(&self) -> Result<Vec<Article>, StorageError>;

    // Operations
    fn insert_operation(&self, operation: &NewOperation) -> Result<Operation, StorageError>;
    fn update_operation(&self, operation: &Operation) -> Result<(), StorageError>;
    fn delete_operation(&self, id: OperationId) -> Result<(), StorageError>;
    fn get_operation(&self, id: OperationId) -> Result<Option<Operation>, StorageError>;
    fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>, StorageError>;
    fn set_operation_balance(&self, ids: &[OperationId], balance_id: Option<BalanceId>) -> Result<usize, StorageError>;
    fn add_credit_for_article(&self, article_id: ArticleId, amount: Decimal) -> Result<usize, StorageError>;

    // Balances
    fn insert_balance(&self, date: Date, totals: &Totals) -> Result<Balance, StorageError>;
    fn update_balance_totals(&self, id: BalanceId, totals: &Totals) -> Result<(), StorageError>;
    fn delete_balance(&self, id: BalanceId) -> Result<(), StorageError>;
    fn get_balance(&self, id: BalanceId) -> Result<Option<Balance>, StorageError>;
    fn list_balances(&self) -> Result<Vec<Balance>, StorageError>;
    fn balances_closing_on(&self, date: Date) -> Result<Vec<Balance>, StorageError>;

    // Users
    fn insert_user(&self, user: &UserRecord) -> Result<(), StorageError>;
    fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}
