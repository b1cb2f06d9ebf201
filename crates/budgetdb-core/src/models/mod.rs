use std::{fmt::Display, str::FromStr};

use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::period::{format_date, iso_date};

pub mod read;
pub mod write;

use read::{
    ArticleOperationRow, ArticleShare, ArticleTotals, BalanceOperationCount,
    BalanceProfitComparison, DateProfit, DateTotals, OperationProfit,
};

pub type ArticleId = i64;
pub type OperationId = i64;
pub type BalanceId = i64;

/// A named expense/income category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub name: String,
}

/// A dated debit/credit entry. `balance_id` is set once the operation is
/// accounted into a closed period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub article_id: ArticleId,
    pub debit: Decimal,
    pub credit: Decimal,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub balance_id: Option<BalanceId>,
}

impl Operation {
    pub fn is_accounted(&self) -> bool {
        self.balance_id.is_some()
    }

    pub fn profit(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// Closed-period rollup. `debit` and `credit` always equal the sums over the
/// operations linked to it, and `amount == debit - credit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Balance {
    pub id: BalanceId,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub debit: Decimal,
    pub credit: Decimal,
    pub amount: Decimal,
}

impl Balance {
    pub fn totals(&self) -> Totals {
        Totals {
            debit: self.debit,
            credit: self.credit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Totals {
    pub debit: Decimal,
    pub credit: Decimal,
}

impl Totals {
    /// Sums debit and credit over `operations`. `None` when a sum leaves the
    /// representable decimal range.
    pub fn of<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Option<Self> {
        operations
            .into_iter()
            .try_fold(Totals::default(), |acc, op| acc.checked_add(op.debit, op.credit))
    }

    pub fn checked_add(self, debit: Decimal, credit: Decimal) -> Option<Self> {
        Some(Totals {
            debit: self.debit.checked_add(debit)?,
            credit: self.credit.checked_add(credit)?,
        })
    }

    /// Both sides are non-negative, so the difference always fits.
    pub fn profit(&self) -> Decimal {
        self.debit - self.credit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Exact role name, case-insensitive. Unlike `FromStr`, unknown names are rejected.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("admin") {
            Some(Role::Admin)
        } else if name.eq_ignore_ascii_case("viewer") {
            Some(Role::Viewer)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    /// Anything other than `admin` is a read-only role.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Role::from_name(s).unwrap_or(Role::Viewer))
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored user. `password_hash` is a PHC string, never the password itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Result of a read-only ledger query, printable as a text table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum ReportValue {
    Articles(Vec<Article>),
    Operations(Vec<Operation>),
    Balances(Vec<Balance>),
    ArticleOperations(Vec<ArticleOperationRow>),
    Dynamics(Vec<DateTotals>),
    Shares(Vec<ArticleShare>),
    ProfitOverTime(Vec<DateProfit>),
    ArticleTotals(Vec<ArticleTotals>),
    BalanceCounts(Vec<BalanceOperationCount>),
    OperationProfits(Vec<OperationProfit>),
    ProfitComparison(Vec<BalanceProfitComparison>),
    Money(Decimal),
    Count(i64),
    Name(String),
}

fn opt<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_default()
}

impl Display for ReportValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        match self {
            ReportValue::Money(m) => return write!(f, "{}", m),
            ReportValue::Count(c) => return write!(f, "{}", c),
            ReportValue::Name(n) => return f.write_str(n),
            ReportValue::Articles(items) => {
                table.add_row(row!["Id", "Name"]);
                table.add_empty_row();
                for a in items {
                    table.add_row(row![a.id, a.name]);
                }
            }
            ReportValue::Operations(items) => {
                table.add_row(row!["Id", "Article", "Debit", "Credit", "Date", "Balance"]);
                table.add_empty_row();
                for o in items {
                    table.add_row(row![o.id, o.article_id, o.debit, o.credit, format_date(o.date), opt(&o.balance_id)]);
                }
            }
            ReportValue::Balances(items) => {
                table.add_row(row!["Id", "Date", "Debit", "Credit", "Amount"]);
                table.add_empty_row();
                for b in items {
                    table.add_row(row![b.id, format_date(b.date), b.debit, b.credit, b.amount]);
                }
            }
            ReportValue::ArticleOperations(items) => {
                table.add_row(row!["Article", "Operation", "Debit", "Credit", "Date"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![
                        r.article_name,
                        opt(&r.operation_id),
                        opt(&r.debit),
                        opt(&r.credit),
                        r.date.map(format_date).unwrap_or_default()
                    ]);
                }
            }
            ReportValue::Dynamics(items) => {
                table.add_row(row!["Date", "Debit", "Credit"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![format_date(r.date), r.debit, r.credit]);
                }
            }
            ReportValue::Shares(items) => {
                table.add_row(row!["Article", "Debit", "Credit", "Profit", "Percent"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![r.article_name, r.debit, r.credit, r.profit, r.percent]);
                }
            }
            ReportValue::ProfitOverTime(items) => {
                table.add_row(row!["Date", "Profit"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![format_date(r.date), r.profit]);
                }
            }
            ReportValue::ArticleTotals(items) => {
                table.add_row(row!["Article", "Debit", "Credit"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![r.article_name, r.debit, r.credit]);
                }
            }
            ReportValue::BalanceCounts(items) => {
                table.add_row(row!["Balance", "Date", "Operations"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![r.balance_id, format_date(r.date), r.operation_count]);
                }
            }
            ReportValue::OperationProfits(items) => {
                table.add_row(row!["Operation", "Article", "Date", "Debit", "Credit", "Profit"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![r.operation_id, r.article_name, format_date(r.date), r.debit, r.credit, r.profit]);
                }
            }
            ReportValue::ProfitComparison(items) => {
                table.add_row(row!["Balance", "Date", "First", "Second"]);
                table.add_empty_row();
                for r in items {
                    table.add_row(row![r.balance_id, format_date(r.date), r.first_profit, r.second_profit]);
                }
            }
        }

        write!(f, "\n{}\n", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    fn op(id: OperationId, debit: Decimal, credit: Decimal) -> Operation {
        Operation {
            id,
            article_id: 1,
            debit,
            credit,
            date: date!(2024 - 11 - 05),
            balance_id: None,
        }
    }

    #[test]
    fn test_totals_of_operations() {
        let ops = vec![op(1, dec!(500), dec!(0)), op(2, dec!(0), dec!(200.50))];
        let totals = Totals::of(&ops).unwrap();
        assert_eq!(totals.debit, dec!(500));
        assert_eq!(totals.credit, dec!(200.50));
        assert_eq!(totals.profit(), dec!(299.50));
        assert_eq!(Totals::of(Vec::<Operation>::new().iter()), Some(Totals::default()));
    }

    #[test]
    fn test_totals_overflow_is_reported() {
        let ops = vec![op(1, Decimal::MAX, dec!(0)), op(2, Decimal::MAX, dec!(0))];
        assert_eq!(Totals::of(&ops), None);
        assert_eq!(Totals::default().checked_add(dec!(0), Decimal::MAX).and_then(|t| t.checked_add(dec!(0), dec!(1))), None);
        assert_eq!(Totals::of(&ops[..1]).unwrap().profit(), Decimal::MAX);
    }

    #[test]
    fn test_role_from_name_is_strict() {
        assert_eq!(Role::from_name("Admin"), Some(Role::Admin));
        assert_eq!(Role::from_name("viewer"), Some(Role::Viewer));
        assert_eq!(Role::from_name("amdin"), None);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("viewer".parse::<Role>().unwrap(), Role::Viewer);
        assert_eq!("accountant".parse::<Role>().unwrap(), Role::Viewer);
        assert!(Role::Admin.can_write());
        assert!(!Role::Viewer.can_write());
    }

    #[test]
    fn test_operation_serializes_iso_date() {
        let json = serde_json::to_value(op(7, dec!(10), dec!(0))).unwrap();
        assert_eq!(json["date"], "2024-11-05");
        assert_eq!(json["balance_id"], serde_json::Value::Null);
    }

    #[test]
    fn test_report_table_lists_rows() {
        let report = ReportValue::Balances(vec![Balance {
            id: 3,
            date: date!(2024 - 11 - 30),
            debit: dec!(500),
            credit: dec!(200),
            amount: dec!(300),
        }]);
        let text = report.to_string();
        assert!(text.contains("2024-11-30"));
        assert!(text.contains("300"));
        assert_eq!(ReportValue::Money(dec!(12.5)).to_string(), "12.5");
    }
}
