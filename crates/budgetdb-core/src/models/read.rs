use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use super::{ArticleId, BalanceId, OperationId};
use crate::period::iso_date;

/// One article joined with one of its operations. Articles without
/// operations appear once with every operation column empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleOperationRow {
    pub article_id: ArticleId,
    pub article_name: String,
    pub operation_id: Option<OperationId>,
    pub debit: Option<Decimal>,
    pub credit: Option<Decimal>,
    #[serde(with = "iso_date::option")]
    pub date: Option<Date>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateTotals {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateProfit {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub profit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleTotals {
    pub article_name: String,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// Which money flow a percentage breakdown is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Income,
    Expense,
    Profit,
}

impl FlowKind {
    pub fn pick(&self, debit: Decimal, credit: Decimal) -> Decimal {
        match self {
            FlowKind::Income => debit,
            FlowKind::Expense => credit,
            FlowKind::Profit => debit - credit,
        }
    }
}

impl FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "income" | "debit" => Ok(FlowKind::Income),
            "expense" | "credit" => Ok(FlowKind::Expense),
            "profit" => Ok(FlowKind::Profit),
            other => Err(format!("unknown flow '{}', expected income, expense or profit", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleShare {
    pub article_name: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub profit: Decimal,
    pub percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceOperationCount {
    pub balance_id: BalanceId,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub operation_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationProfit {
    pub operation_id: OperationId,
    pub article_name: String,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub debit: Decimal,
    pub credit: Decimal,
    pub profit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceProfitComparison {
    pub balance_id: BalanceId,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub first_profit: Decimal,
    pub second_profit: Decimal,
}
