use rust_decimal::Decimal;
use time::Date;

use super::{ArticleId, BalanceId};
use crate::period::DateRange;

#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub article_id: ArticleId,
    pub debit: Decimal,
    pub credit: Decimal,
    pub date: Date,
    pub balance_id: Option<BalanceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceLink {
    Unaccounted,
    Accounted,
    Balance(BalanceId),
}

/// Selection of operations. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationFilter {
    pub article_id: Option<ArticleId>,
    pub link: Option<BalanceLink>,
    pub range: Option<DateRange>,
}

impl OperationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_range(range: DateRange) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }

    pub fn for_article(article_id: ArticleId) -> Self {
        Self {
            article_id: Some(article_id),
            ..Self::default()
        }
    }

    pub fn for_balance(balance_id: BalanceId) -> Self {
        Self {
            link: Some(BalanceLink::Balance(balance_id)),
            ..Self::default()
        }
    }

    pub fn unaccounted() -> Self {
        Self {
            link: Some(BalanceLink::Unaccounted),
            ..Self::default()
        }
    }
}
