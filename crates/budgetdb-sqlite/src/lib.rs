//! SQLite storage backend for BudgetDB.

use std::{
    ops::Deref,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, ThreadId},
};

use budgetdb_core::{
    format_date, parse_date, Article, ArticleId, Balance, BalanceId, BalanceLink, LedgerStore,
    NewOperation, Operation, OperationFilter, OperationId, Role, StorageError, Totals,
    TransactionId, UserRecord,
};
use rusqlite::{params, params_from_iter, types::Type, types::Value, Connection, ErrorCode, Row};
use rust_decimal::Decimal;
use time::Date;

#[derive(Debug, Clone, Copy)]
struct ActiveTransaction {
    id: TransactionId,
    owner: ThreadId,
}

/// All callers share one connection. A transaction belongs to the thread
/// that began it: statements from other threads wait until it commits or
/// rolls back, so they never see or join uncommitted work.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<ActiveTransaction>>,
    tx_finished: Condvar,
}

/// Connection access for one statement. Holding it keeps other threads from
/// opening a transaction underneath the statement.
struct Session<'a> {
    conn: MutexGuard<'a, Connection>,
    _turn: MutexGuard<'a, Option<ActiveTransaction>>,
}

impl Deref for Session<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(map_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
            tx_finished: Condvar::new(),
        };
        storage.init_schema()?;
        tracing::debug!(path, "SQLite ledger store opened");
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS balances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                debit TEXT NOT NULL,
                credit TEXT NOT NULL,
                amount TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                debit TEXT NOT NULL,
                credit TEXT NOT NULL,
                date TEXT NOT NULL,
                balance_id INTEGER,
                FOREIGN KEY (article_id) REFERENCES articles(id) ON DELETE CASCADE,
                FOREIGN KEY (balance_id) REFERENCES balances(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_date
                ON operations(date);

            CREATE INDEX IF NOT EXISTS idx_operations_balance
                ON operations(balance_id);

            CREATE INDEX IF NOT EXISTS idx_operations_article
                ON operations(article_id);

            CREATE INDEX IF NOT EXISTS idx_balances_date
                ON balances(date);

            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL
            );
            ",
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn conn(&self) -> Session<'_> {
        let turn = self.turn();
        Session {
            conn: self.lock_connection(),
            _turn: turn,
        }
    }

    // Poisoning only means a caller panicked between statements; SQLite
    // itself has no half-applied statement to worry about.
    fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while another thread owns an open transaction.
    fn turn(&self) -> MutexGuard<'_, Option<ActiveTransaction>> {
        let me = thread::current().id();
        let mut active = self.active_tx.lock().unwrap_or_else(PoisonError::into_inner);
        while active.map_or(false, |tx| tx.owner != me) {
            active = self
                .tx_finished
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        active
    }

    fn finish_transaction(&self, mut active: MutexGuard<'_, Option<ActiveTransaction>>) {
        *active = None;
        drop(active);
        self.tx_finished.notify_all();
    }
}

fn map_err(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
            StorageError::Constraint(msg.unwrap_or_else(|| err.to_string()))
        }
        rusqlite::Error::FromSqlConversionFailure(idx, _, cause) => {
            StorageError::Corrupt(format!("column {}: {}", idx, cause))
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_failure(idx, e))
}

fn date_col(row: &Row, idx: usize) -> rusqlite::Result<Date> {
    let s: String = row.get(idx)?;
    parse_date(&s).map_err(|e| conversion_failure(idx, e))
}

const OPERATION_COLUMNS: &str = "id, article_id, debit, credit, date, balance_id";
const BALANCE_COLUMNS: &str = "id, date, debit, credit, amount";

fn operation_row(row: &Row) -> rusqlite::Result<Operation> {
    Ok(Operation {
        id: row.get(0)?,
        article_id: row.get(1)?,
        debit: decimal_col(row, 2)?,
        credit: decimal_col(row, 3)?,
        date: date_col(row, 4)?,
        balance_id: row.get(5)?,
    })
}

fn balance_row(row: &Row) -> rusqlite::Result<Balance> {
    Ok(Balance {
        id: row.get(0)?,
        date: date_col(row, 1)?,
        debit: decimal_col(row, 2)?,
        credit: decimal_col(row, 3)?,
        amount: decimal_col(row, 4)?,
    })
}

fn article_row(row: &Row) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

impl LedgerStore for SqliteStorage {
    fn insert_article(&self, name: &str) -> Result<Article, StorageError> {
        let conn = self.conn();
        conn.execute("INSERT INTO articles (name) VALUES (?1)", params![name])
            .map_err(map_err)?;
        Ok(Article {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    fn rename_article(&self, old_name: &str, new_name: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE articles SET name = ?1 WHERE name = ?2",
                params![new_name, old_name],
            )
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("article '{}'", old_name)));
        }
        Ok(())
    }

    fn delete_article(&self, id: ArticleId) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute("DELETE FROM operations WHERE article_id = ?1", params![id])
            .map_err(map_err)?;
        let changed = conn
            .execute("DELETE FROM articles WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("article #{}", id)));
        }
        Ok(())
    }

    fn find_article(&self, name: &str) -> Result<Option<Article>, StorageError> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT id, name FROM articles WHERE name = ?1",
            params![name],
            article_row,
        );
        match result {
            Ok(article) => Ok(Some(article)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    fn list_articles(&self) -> Result<Vec<Article>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name FROM articles ORDER BY id")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], article_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn insert_operation(&self, operation: &NewOperation) -> Result<Operation, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operations (article_id, debit, credit, date, balance_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                operation.article_id,
                operation.debit.to_string(),
                operation.credit.to_string(),
                format_date(operation.date),
                operation.balance_id
            ],
        )
        .map_err(map_err)?;
        Ok(Operation {
            id: conn.last_insert_rowid(),
            article_id: operation.article_id,
            debit: operation.debit,
            credit: operation.credit,
            date: operation.date,
            balance_id: operation.balance_id,
        })
    }

    fn update_operation(&self, operation: &Operation) -> Result<(), StorageError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE operations SET article_id = ?1, debit = ?2, credit = ?3, date = ?4, balance_id = ?5 WHERE id = ?6",
                params![
                    operation.article_id,
                    operation.debit.to_string(),
                    operation.credit.to_string(),
                    format_date(operation.date),
                    operation.balance_id,
                    operation.id
                ],
            )
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("operation #{}", operation.id)));
        }
        Ok(())
    }

    fn delete_operation(&self, id: OperationId) -> Result<(), StorageError> {
        let conn = self.conn();
        let changed = conn
            .execute("DELETE FROM operations WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("operation #{}", id)));
        }
        Ok(())
    }

    fn get_operation(&self, id: OperationId) -> Result<Option<Operation>, StorageError> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
            params![id],
            operation_row,
        );
        match result {
            Ok(op) => Ok(Some(op)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>, StorageError> {
        let mut query = format!("SELECT {} FROM operations WHERE 1 = 1", OPERATION_COLUMNS);
        let mut args: Vec<Value> = Vec::new();

        if let Some(article_id) = filter.article_id {
            query.push_str(" AND article_id = ?");
            args.push(Value::Integer(article_id));
        }
        match filter.link {
            Some(BalanceLink::Unaccounted) => query.push_str(" AND balance_id IS NULL"),
            Some(BalanceLink::Accounted) => query.push_str(" AND balance_id IS NOT NULL"),
            Some(BalanceLink::Balance(id)) => {
                query.push_str(" AND balance_id = ?");
                args.push(Value::Integer(id));
            }
            None => {}
        }
        if let Some(range) = filter.range {
            query.push_str(" AND date >= ? AND date <= ?");
            args.push(Value::Text(format_date(range.start)));
            args.push(Value::Text(format_date(range.end)));
        }
        query.push_str(" ORDER BY id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&query).map_err(map_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), operation_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn set_operation_balance(&self, ids: &[OperationId], balance_id: Option<BalanceId>) -> Result<usize, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("UPDATE operations SET balance_id = ?1 WHERE id = ?2")
            .map_err(map_err)?;
        let mut changed = 0;
        for id in ids {
            changed += stmt.execute(params![balance_id, id]).map_err(map_err)?;
        }
        Ok(changed)
    }

    fn add_credit_for_article(&self, article_id: ArticleId, amount: Decimal) -> Result<usize, StorageError> {
        let conn = self.conn();
        let credits = {
            let mut stmt = conn
                .prepare("SELECT id, credit FROM operations WHERE article_id = ?1 ORDER BY id")
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![article_id], |row| {
                    Ok((row.get::<_, OperationId>(0)?, decimal_col(row, 1)?))
                })
                .map_err(map_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?;
            rows
        };

        let mut stmt = conn
            .prepare("UPDATE operations SET credit = ?1 WHERE id = ?2")
            .map_err(map_err)?;
        for (id, credit) in &credits {
            let credit = credit.checked_add(amount).ok_or_else(|| {
                StorageError::Constraint(format!("credit of operation #{} overflows", id))
            })?;
            stmt.execute(params![credit.to_string(), id])
                .map_err(map_err)?;
        }
        Ok(credits.len())
    }

    fn insert_balance(&self, date: Date, totals: &Totals) -> Result<Balance, StorageError> {
        let conn = self.conn();
        let amount = totals.profit();
        conn.execute(
            "INSERT INTO balances (date, debit, credit, amount) VALUES (?1, ?2, ?3, ?4)",
            params![
                format_date(date),
                totals.debit.to_string(),
                totals.credit.to_string(),
                amount.to_string()
            ],
        )
        .map_err(map_err)?;
        Ok(Balance {
            id: conn.last_insert_rowid(),
            date,
            debit: totals.debit,
            credit: totals.credit,
            amount,
        })
    }

    fn update_balance_totals(&self, id: BalanceId, totals: &Totals) -> Result<(), StorageError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE balances SET debit = ?1, credit = ?2, amount = ?3 WHERE id = ?4",
                params![
                    totals.debit.to_string(),
                    totals.credit.to_string(),
                    totals.profit().to_string(),
                    id
                ],
            )
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("balance #{}", id)));
        }
        Ok(())
    }

    fn delete_balance(&self, id: BalanceId) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute("UPDATE operations SET balance_id = NULL WHERE balance_id = ?1", params![id])
            .map_err(map_err)?;
        let changed = conn
            .execute("DELETE FROM balances WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("balance #{}", id)));
        }
        Ok(())
    }

    fn get_balance(&self, id: BalanceId) -> Result<Option<Balance>, StorageError> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {} FROM balances WHERE id = ?1", BALANCE_COLUMNS),
            params![id],
            balance_row,
        );
        match result {
            Ok(b) => Ok(Some(b)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    fn list_balances(&self) -> Result<Vec<Balance>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM balances ORDER BY id", BALANCE_COLUMNS))
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], balance_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn balances_closing_on(&self, date: Date) -> Result<Vec<Balance>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM balances WHERE date = ?1 ORDER BY id", BALANCE_COLUMNS))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![format_date(date)], balance_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn insert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
            params![user.username, user.password_hash, user.role.as_str()],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT username, password_hash, role FROM users WHERE username = ?1",
            params![username],
            |row| {
                let role: String = row.get(2)?;
                Ok(UserRecord {
                    username: row.get(0)?,
                    password_hash: row.get(1)?,
                    role: role.parse::<Role>().unwrap_or(Role::Viewer),
                })
            },
        );
        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut active = self.turn();
        if active.is_some() {
            return Err(StorageError::Other("transaction already active".to_string()));
        }
        self.lock_connection()
            .execute_batch("SAVEPOINT budgetdb_tx")
            .map_err(map_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *active = Some(ActiveTransaction {
            id: tx_id,
            owner: thread::current().id(),
        });
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let active = self.turn();
        if active.map(|tx| tx.id) != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        self.lock_connection()
            .execute_batch("RELEASE SAVEPOINT budgetdb_tx")
            .map_err(map_err)?;
        self.finish_transaction(active);
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let active = self.turn();
        if active.map(|tx| tx.id) != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        // ROLLBACK TO keeps the savepoint open; release it so the next begin starts clean.
        self.lock_connection()
            .execute_batch("ROLLBACK TO SAVEPOINT budgetdb_tx; RELEASE SAVEPOINT budgetdb_tx")
            .map_err(map_err)?;
        self.finish_transaction(active);
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}
