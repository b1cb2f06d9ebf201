use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError},
};

use budgetdb_core::{
    format_date, period::iso_date, period_of, Article, Balance, BalanceId, DateRange,
    LedgerStore, NewOperation, Operation, OperationFilter, OperationId, StorageError, Totals,
    TransactionId,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use time::Date;

use crate::auth::CallerIdentity;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("profit {profit} is below the required minimum {minimum}")]
    BelowMinimumProfit { profit: Decimal, minimum: Decimal },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("storage failure: {0}")]
    Transport(String),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => EngineError::NotFound(what),
            StorageError::Constraint(msg) => EngineError::ConstraintViolation(msg),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationInput {
    pub article: String,
    pub debit: Decimal,
    pub credit: Decimal,
    #[serde(with = "iso_date")]
    pub date: Date,
}

/// Replacement values for an existing operation. The date is kept when
/// omitted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationUpdate {
    pub article: String,
    pub debit: Decimal,
    pub credit: Decimal,
    #[serde(default, with = "iso_date::option")]
    pub date: Option<Date>,
}

/// Owns every mutation of the ledger.
///
/// Each public method runs as a single store transaction and keeps the
/// balance invariant: a balance's debit and credit equal the sums over the
/// operations linked to it. Mutations require a caller whose role can write.
pub struct BalanceEngine {
    storage: Arc<dyn LedgerStore>,
    // Savepoints on one connection must not interleave.
    write_lock: Mutex<()>,
}

impl BalanceEngine {
    pub fn new(storage: Arc<dyn LedgerStore>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn LedgerStore> {
        &self.storage
    }

    fn authorize(&self, caller: &CallerIdentity, action: &'static str) -> Result<(), EngineError> {
        if caller.role.can_write() {
            return Ok(());
        }
        tracing::warn!(caller = %caller.name, role = %caller.role, action, "Mutation rejected");
        metrics::counter!("budgetdb_engine_denied_total", 1, "action" => action);
        Err(EngineError::PermissionDenied(format!(
            "{} requires the admin role",
            action
        )))
    }

    fn in_transaction<T>(
        &self,
        action: &'static str,
        f: impl FnOnce(&dyn LedgerStore) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        // A panicking closure already had its transaction rolled back by
        // `OpenTransaction`, so the ledger behind a poisoned lock is intact.
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = OpenTransaction::begin(self.storage.as_ref())?;
        match f(self.storage.as_ref()) {
            Ok(value) => {
                tx.commit()?;
                metrics::counter!("budgetdb_engine_committed_total", 1, "action" => action);
                Ok(value)
            }
            Err(e) => {
                drop(tx);
                tracing::warn!(action, error = %e, "Transaction rolled back");
                metrics::counter!("budgetdb_engine_rolled_back_total", 1, "action" => action);
                Err(e)
            }
        }
    }

    pub fn add_article(&self, caller: &CallerIdentity, name: &str) -> Result<Article, EngineError> {
        self.authorize(caller, "add_article")?;
        let name = validate_name(name)?;
        let article = self.in_transaction("add_article", |store| Ok(store.insert_article(name)?))?;
        tracing::info!(article = %article.name, id = article.id, "Article added");
        Ok(article)
    }

    pub fn rename_article(&self, caller: &CallerIdentity, old_name: &str, new_name: &str) -> Result<(), EngineError> {
        self.authorize(caller, "rename_article")?;
        let new_name = validate_name(new_name)?;
        self.in_transaction("rename_article", |store| Ok(store.rename_article(old_name, new_name)?))?;
        tracing::info!(from = %old_name, to = %new_name, "Article renamed");
        Ok(())
    }

    /// Deletes the article and its operations, then recomputes every balance
    /// that contained one of them. Returns the recomputed balance ids.
    pub fn delete_article_and_recalculate_balances(
        &self,
        caller: &CallerIdentity,
        name: &str,
    ) -> Result<Vec<BalanceId>, EngineError> {
        self.authorize(caller, "delete_article")?;
        let affected = self.in_transaction("delete_article", |store| {
            let article = require_article(store, name)?;
            let operations = store.list_operations(&OperationFilter::for_article(article.id))?;
            let affected = linked_balances(&operations);
            store.delete_article(article.id)?;
            recompute_balances(store, &affected)?;
            Ok(affected)
        })?;
        tracing::info!(article = %name, balances = ?affected, "Article deleted");
        Ok(affected.into_iter().collect())
    }

    /// Adds `amount` to the credit of every operation under the article.
    /// Returns the number of operations changed.
    pub fn increase_expenses_for_article(
        &self,
        caller: &CallerIdentity,
        name: &str,
        amount: Decimal,
    ) -> Result<usize, EngineError> {
        self.authorize(caller, "increase_expenses")?;
        let changed = self.in_transaction("increase_expenses", |store| {
            let article = require_article(store, name)?;
            let operations = store.list_operations(&OperationFilter::for_article(article.id))?;
            for op in &operations {
                match op.credit.checked_add(amount) {
                    Some(credit) if credit >= Decimal::ZERO => {}
                    Some(_) => {
                        return Err(EngineError::ConstraintViolation(format!(
                            "credit of operation #{} would become negative",
                            op.id
                        )))
                    }
                    None => return Err(overflow(&format!("credit of operation #{}", op.id))),
                }
            }
            let changed = store.add_credit_for_article(article.id, amount)?;
            recompute_balances(store, &linked_balances(&operations))?;
            Ok(changed)
        })?;
        tracing::info!(article = %name, %amount, operations = changed, "Expenses increased");
        Ok(changed)
    }

    /// Inserts an operation. If a balance already closes the operation's
    /// month, the operation is accounted into it right away.
    pub fn add_operation(&self, caller: &CallerIdentity, input: &OperationInput) -> Result<Operation, EngineError> {
        self.authorize(caller, "add_operation")?;
        validate_amounts(input.debit, input.credit)?;
        let operation = self.in_transaction("add_operation", |store| {
            let article = require_article(store, &input.article)?;
            let balance_id = closing_balance(store, input.date)?;
            let operation = store.insert_operation(&NewOperation {
                article_id: article.id,
                debit: input.debit,
                credit: input.credit,
                date: input.date,
                balance_id,
            })?;
            if let Some(id) = balance_id {
                recompute_balance(store, id)?;
            }
            Ok(operation)
        })?;
        tracing::info!(
            id = operation.id,
            article = %input.article,
            date = %format_date(operation.date),
            balance = ?operation.balance_id,
            "Operation added"
        );
        Ok(operation)
    }

    /// Rewrites an operation. An accounted operation stays in its balance; an
    /// unaccounted one joins the balance closing its (new) month if any.
    pub fn update_operation(
        &self,
        caller: &CallerIdentity,
        id: OperationId,
        update: &OperationUpdate,
    ) -> Result<Operation, EngineError> {
        self.authorize(caller, "update_operation")?;
        validate_amounts(update.debit, update.credit)?;
        let operation = self.in_transaction("update_operation", |store| {
            let existing = store
                .get_operation(id)?
                .ok_or_else(|| EngineError::NotFound(format!("operation #{}", id)))?;
            let article = require_article(store, &update.article)?;
            let date = update.date.unwrap_or(existing.date);
            let balance_id = match existing.balance_id {
                Some(b) => Some(b),
                None => closing_balance(store, date)?,
            };
            let updated = Operation {
                id,
                article_id: article.id,
                debit: update.debit,
                credit: update.credit,
                date,
                balance_id,
            };
            store.update_operation(&updated)?;
            recompute_balances(store, &linked_balances([&existing, &updated]))?;
            Ok(updated)
        })?;
        tracing::info!(id, balance = ?operation.balance_id, "Operation updated");
        Ok(operation)
    }

    pub fn delete_operation(&self, caller: &CallerIdentity, id: OperationId) -> Result<Operation, EngineError> {
        self.authorize(caller, "delete_operation")?;
        let operation = self.in_transaction("delete_operation", |store| {
            let existing = store
                .get_operation(id)?
                .ok_or_else(|| EngineError::NotFound(format!("operation #{}", id)))?;
            store.delete_operation(id)?;
            if let Some(balance_id) = existing.balance_id {
                recompute_balance(store, balance_id)?;
            }
            Ok(existing)
        })?;
        tracing::info!(id, balance = ?operation.balance_id, "Operation deleted");
        Ok(operation)
    }

    /// Closes `range` into a new balance dated `range.end` when the period's
    /// profit reaches `min_profit`. Below the threshold nothing is written.
    pub fn create_balance_if_profitable(
        &self,
        caller: &CallerIdentity,
        range: DateRange,
        min_profit: Decimal,
    ) -> Result<Balance, EngineError> {
        self.authorize(caller, "create_balance")?;
        check_range(range)?;
        let balance = self.in_transaction("create_balance", |store| {
            let operations = store.list_operations(&OperationFilter::in_range(range))?;
            let totals = Totals::of(&operations).ok_or_else(|| overflow(&format!("totals of {}", range)))?;
            let profit = totals.profit();
            if profit < min_profit {
                return Err(EngineError::BelowMinimumProfit {
                    profit,
                    minimum: min_profit,
                });
            }

            let balance = store.insert_balance(range.end, &totals)?;
            let ids: Vec<OperationId> = operations.iter().map(|op| op.id).collect();
            store.set_operation_balance(&ids, Some(balance.id))?;

            // operations moved out of older balances leave those balances short
            let mut previous = linked_balances(&operations);
            previous.remove(&balance.id);
            recompute_balances(store, &previous)?;
            Ok(balance)
        })?;
        tracing::info!(
            id = balance.id,
            period = %range,
            amount = %balance.amount,
            "Balance created"
        );
        Ok(balance)
    }

    /// Removes the balance with the lowest amount (lowest id on ties) and
    /// returns its operations to the unaccounted state.
    pub fn delete_most_unprofitable_balance(&self, caller: &CallerIdentity) -> Result<Balance, EngineError> {
        self.authorize(caller, "delete_unprofitable_balance")?;
        let balance = self.in_transaction("delete_unprofitable_balance", |store| {
            let balance = store
                .list_balances()?
                .into_iter()
                .min_by(|a, b| a.amount.cmp(&b.amount).then(a.id.cmp(&b.id)))
                .ok_or_else(|| EngineError::NotFound("no balances".to_string()))?;
            store.delete_balance(balance.id)?;
            Ok(balance)
        })?;
        tracing::info!(id = balance.id, amount = %balance.amount, "Most unprofitable balance deleted");
        Ok(balance)
    }

    pub fn delete_balance_by_date(&self, caller: &CallerIdentity, date: Date) -> Result<Vec<Balance>, EngineError> {
        self.authorize(caller, "delete_balance")?;
        let deleted = self.in_transaction("delete_balance", |store| {
            let balances = store.balances_closing_on(date)?;
            if balances.is_empty() {
                return Err(EngineError::NotFound(format!("balance closing on {}", format_date(date))));
            }
            for balance in &balances {
                store.delete_balance(balance.id)?;
            }
            Ok(balances)
        })?;
        tracing::info!(date = %format_date(date), count = deleted.len(), "Balances deleted");
        Ok(deleted)
    }
}

/// Rolls the store transaction back on drop unless it was committed, so an
/// early return or a panic never leaves a savepoint open.
struct OpenTransaction<'a> {
    store: &'a dyn LedgerStore,
    tx_id: TransactionId,
    committed: bool,
}

impl<'a> OpenTransaction<'a> {
    fn begin(store: &'a dyn LedgerStore) -> Result<Self, EngineError> {
        let tx_id = store.begin_transaction()?;
        Ok(Self {
            store,
            tx_id,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<(), EngineError> {
        self.store.commit_transaction(self.tx_id)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.store.rollback_transaction(self.tx_id) {
            tracing::error!(tx_id = self.tx_id, error = %e, "Rollback failed");
        }
    }
}

pub(crate) fn overflow(what: &str) -> EngineError {
    EngineError::ConstraintViolation(format!("{} exceeds the supported amount range", what))
}

pub(crate) fn check_range(range: DateRange) -> Result<(), EngineError> {
    if range.is_empty() {
        return Err(EngineError::ConstraintViolation(format!(
            "period {} ends before it starts",
            range
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<&str, EngineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::ConstraintViolation("article name must not be empty".to_string()));
    }
    Ok(trimmed)
}

fn validate_amounts(debit: Decimal, credit: Decimal) -> Result<(), EngineError> {
    if debit < Decimal::ZERO || credit < Decimal::ZERO {
        return Err(EngineError::ConstraintViolation(
            "debit and credit must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn require_article(store: &dyn LedgerStore, name: &str) -> Result<Article, EngineError> {
    store
        .find_article(name)?
        .ok_or_else(|| EngineError::NotFound(format!("article '{}'", name)))
}

/// Balance closing the month of `date`, lowest id first when several do.
fn closing_balance(store: &dyn LedgerStore, date: Date) -> Result<Option<BalanceId>, EngineError> {
    Ok(store
        .balances_closing_on(period_of(date).end)?
        .first()
        .map(|b| b.id))
}

fn linked_balances<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> BTreeSet<BalanceId> {
    operations.into_iter().filter_map(|op| op.balance_id).collect()
}

/// Re-sums a balance over its linked operations. A balance left without
/// operations keeps existing with zero aggregates.
fn recompute_balance(store: &dyn LedgerStore, id: BalanceId) -> Result<Totals, EngineError> {
    let operations = store.list_operations(&OperationFilter::for_balance(id))?;
    let totals = Totals::of(&operations).ok_or_else(|| overflow(&format!("totals of balance #{}", id)))?;
    store.update_balance_totals(id, &totals)?;
    tracing::debug!(balance = id, debit = %totals.debit, credit = %totals.credit, "Balance recomputed");
    Ok(totals)
}

fn recompute_balances(store: &dyn LedgerStore, ids: &BTreeSet<BalanceId>) -> Result<(), EngineError> {
    for id in ids {
        recompute_balance(store, *id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use budgetdb_core::Role;
    use budgetdb_sqlite::SqliteStorage;
    use rust_decimal_macros::dec;
    use time::macros::date;

    fn engine() -> BalanceEngine {
        BalanceEngine::new(Arc::new(SqliteStorage::new(":memory:").unwrap()))
    }

    fn admin() -> CallerIdentity {
        CallerIdentity::new("admin", Role::Admin)
    }

    #[test]
    fn test_validate_amounts() {
        assert!(validate_amounts(dec!(0), dec!(0)).is_ok());
        assert!(validate_amounts(dec!(10.5), dec!(0)).is_ok());
        assert!(validate_amounts(dec!(-0.01), dec!(0)).is_err());
        assert!(validate_amounts(dec!(0), dec!(-3)).is_err());
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("  food ").unwrap(), "food");
        assert!(matches!(validate_name("   "), Err(EngineError::ConstraintViolation(_))));
    }

    #[test]
    fn test_storage_errors_map_to_engine_errors() {
        assert!(matches!(
            EngineError::from(StorageError::NotFound("x".into())),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            EngineError::from(StorageError::Constraint("x".into())),
            EngineError::ConstraintViolation(_)
        ));
        assert!(matches!(
            EngineError::from(StorageError::NoActiveTransaction),
            EngineError::Transport(_)
        ));
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let engine = engine();
        let result: Result<(), EngineError> = engine.in_transaction("test", |store| {
            store.insert_article("food")?;
            Err(EngineError::ConstraintViolation("forced".to_string()))
        });
        assert!(result.is_err());
        assert!(engine.storage().list_articles().unwrap().is_empty());

        // the engine stays usable after a rollback
        engine.add_article(&admin(), "food").unwrap();
        assert_eq!(engine.storage().list_articles().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_closure_does_not_wedge_engine() {
        let engine = engine();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.in_transaction::<()>("test", |store| {
                store.insert_article("food")?;
                panic!("statement blew up");
            })
        }));
        assert!(outcome.is_err());
        assert!(engine.storage().list_articles().unwrap().is_empty());

        engine.add_article(&admin(), "food").unwrap();
        assert_eq!(engine.storage().list_articles().unwrap().len(), 1);
    }

    #[test]
    fn test_increase_expenses_overflow_is_rejected() {
        let engine = engine();
        engine.add_article(&admin(), "food").unwrap();
        let op = engine
            .add_operation(
                &admin(),
                &OperationInput {
                    article: "food".to_string(),
                    debit: dec!(0),
                    credit: dec!(1),
                    date: date!(2024 - 11 - 05),
                },
            )
            .unwrap();

        assert!(matches!(
            engine.increase_expenses_for_article(&admin(), "food", Decimal::MAX),
            Err(EngineError::ConstraintViolation(_))
        ));
        assert_eq!(engine.storage().get_operation(op.id).unwrap().unwrap().credit, dec!(1));
        // later writes still go through
        assert_eq!(engine.increase_expenses_for_article(&admin(), "food", dec!(2)).unwrap(), 1);
    }

    #[test]
    fn test_balance_totals_overflow_is_rejected() {
        let engine = engine();
        engine.add_article(&admin(), "salary").unwrap();
        for day in [date!(2024 - 11 - 05), date!(2024 - 11 - 06)] {
            engine
                .add_operation(
                    &admin(),
                    &OperationInput {
                        article: "salary".to_string(),
                        debit: Decimal::MAX,
                        credit: dec!(0),
                        date: day,
                    },
                )
                .unwrap();
        }

        let november = DateRange::new(date!(2024 - 11 - 01), date!(2024 - 11 - 30));
        assert!(matches!(
            engine.create_balance_if_profitable(&admin(), november, dec!(0)),
            Err(EngineError::ConstraintViolation(_))
        ));
        assert!(engine.storage().list_balances().unwrap().is_empty());
        engine.add_article(&admin(), "food").unwrap();
    }

    #[test]
    fn test_closing_balance_uses_month_end() {
        let engine = engine();
        let store = engine.storage().as_ref();
        let nov = store.insert_balance(date!(2024 - 11 - 30), &Totals::default()).unwrap();
        store.insert_balance(date!(2024 - 11 - 15), &Totals::default()).unwrap();
        assert_eq!(closing_balance(store, date!(2024 - 11 - 02)).unwrap(), Some(nov.id));
        assert_eq!(closing_balance(store, date!(2024 - 12 - 02)).unwrap(), None);
    }

    #[test]
    fn test_operation_update_deserializes_without_date() {
        let update: OperationUpdate =
            serde_json::from_str(r#"{"article":"food","debit":"0","credit":"12.5"}"#).unwrap();
        assert_eq!(update.date, None);
        assert_eq!(update.credit, dec!(12.5));
    }
}
