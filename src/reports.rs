use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use budgetdb_core::{
    Article, ArticleId, ArticleOperationRow, ArticleShare, ArticleTotals, Balance, BalanceId,
    BalanceOperationCount, BalanceProfitComparison, DateProfit, DateRange, DateTotals, FlowKind,
    LedgerStore, Operation, OperationFilter, OperationProfit, ReportValue, Totals,
};
use clap::Subcommand;
use rust_decimal::Decimal;
use time::Date;

use crate::engine::{check_range, overflow, EngineError};

/// Read-only aggregations over the ledger. Sums are computed in Rust over
/// exact decimals.
pub struct LedgerReports {
    storage: Arc<dyn LedgerStore>,
}

impl LedgerReports {
    pub fn new(storage: Arc<dyn LedgerStore>) -> Self {
        Self { storage }
    }

    pub fn articles(&self) -> Result<Vec<Article>, EngineError> {
        Ok(self.storage.list_articles()?)
    }

    pub fn operations(&self) -> Result<Vec<Operation>, EngineError> {
        Ok(self.storage.list_operations(&OperationFilter::all())?)
    }

    pub fn balances(&self) -> Result<Vec<Balance>, EngineError> {
        Ok(self.storage.list_balances()?)
    }

    /// Articles with no operation dated inside `range`.
    pub fn unused_articles(&self, range: DateRange) -> Result<Vec<Article>, EngineError> {
        check_range(range)?;
        let used: HashSet<ArticleId> = self
            .storage
            .list_operations(&OperationFilter::in_range(range))?
            .iter()
            .map(|op| op.article_id)
            .collect();
        Ok(self
            .articles()?
            .into_iter()
            .filter(|a| !used.contains(&a.id))
            .collect())
    }

    /// Every article with each of its operations, ordered by article name
    /// then date. Articles without operations appear once with empty columns.
    pub fn articles_with_operations(&self) -> Result<Vec<ArticleOperationRow>, EngineError> {
        let mut articles = self.articles()?;
        articles.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let mut by_article = self.operations_by_article(&OperationFilter::all())?;

        let mut rows = Vec::new();
        for article in articles {
            let mut operations = by_article.remove(&article.id).unwrap_or_default();
            if operations.is_empty() {
                rows.push(ArticleOperationRow {
                    article_id: article.id,
                    article_name: article.name,
                    operation_id: None,
                    debit: None,
                    credit: None,
                    date: None,
                });
                continue;
            }
            operations.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
            rows.extend(operations.into_iter().map(|op| ArticleOperationRow {
                article_id: article.id,
                article_name: article.name.clone(),
                operation_id: Some(op.id),
                debit: Some(op.debit),
                credit: Some(op.credit),
                date: Some(op.date),
            }));
        }
        Ok(rows)
    }

    /// Σ(debit − credit) of the article's accounted operations whose balance
    /// closes inside `range`.
    pub fn profit_by_article(&self, article: &str, range: DateRange) -> Result<Decimal, EngineError> {
        Ok(self.accounted_totals(article, range)?.profit())
    }

    pub fn total_credit_by_article(&self, article: &str, range: DateRange) -> Result<Decimal, EngineError> {
        Ok(self.accounted_totals(article, range)?.credit)
    }

    /// Number of distinct balances linking at least one of the article's operations.
    pub fn balance_count_for_article(&self, article: &str) -> Result<i64, EngineError> {
        let article = self.require_article(article)?;
        let mut balances: Vec<BalanceId> = self
            .storage
            .list_operations(&OperationFilter::for_article(article.id))?
            .iter()
            .filter_map(|op| op.balance_id)
            .collect();
        balances.sort_unstable();
        balances.dedup();
        Ok(balances.len() as i64)
    }

    /// Debit and credit per operation date, over the named articles (all
    /// articles when `articles` is empty).
    pub fn income_expense_dynamics(
        &self,
        articles: &[String],
        range: DateRange,
    ) -> Result<Vec<DateTotals>, EngineError> {
        check_range(range)?;
        let selected = self.select_articles(articles)?;
        let mut by_date: BTreeMap<Date, Totals> = BTreeMap::new();
        for op in self.selected_operations(&selected, range)? {
            accumulate(by_date.entry(op.date).or_default(), &op)?;
        }
        Ok(by_date
            .into_iter()
            .map(|(date, totals)| DateTotals {
                date,
                debit: totals.debit,
                credit: totals.credit,
            })
            .collect())
    }

    /// Per-article share of one money flow over the selection, in percent
    /// rounded to two places. Only articles with operations in `range` are
    /// listed, ordered by name.
    pub fn financial_percentages(
        &self,
        articles: &[String],
        flow: FlowKind,
        range: DateRange,
    ) -> Result<Vec<ArticleShare>, EngineError> {
        check_range(range)?;
        let selected = self.select_articles(articles)?;
        let mut per_article: BTreeMap<ArticleId, Totals> = BTreeMap::new();
        for op in self.selected_operations(&selected, range)? {
            accumulate(per_article.entry(op.article_id).or_default(), &op)?;
        }

        let total = per_article
            .values()
            .try_fold(Decimal::ZERO, |sum, t| sum.checked_add(flow.pick(t.debit, t.credit)))
            .ok_or_else(|| overflow("flow total"))?;

        let mut shares: Vec<ArticleShare> = selected
            .into_iter()
            .filter_map(|article| {
                let totals = per_article.get(&article.id)?;
                Some(ArticleShare {
                    article_name: article.name,
                    debit: totals.debit,
                    credit: totals.credit,
                    profit: totals.profit(),
                    percent: percent_of(flow.pick(totals.debit, totals.credit), total),
                })
            })
            .collect();
        shares.sort_by(|a, b| a.article_name.cmp(&b.article_name));
        Ok(shares)
    }

    pub fn total_profit_over_time(&self, range: DateRange) -> Result<Vec<DateProfit>, EngineError> {
        check_range(range)?;
        let mut by_date: BTreeMap<Date, Decimal> = BTreeMap::new();
        for op in self.storage.list_operations(&OperationFilter::in_range(range))? {
            let profit = by_date.entry(op.date).or_default();
            *profit = profit
                .checked_add(op.profit())
                .ok_or_else(|| overflow(&format!("profit on {}", op.date)))?;
        }
        Ok(by_date
            .into_iter()
            .map(|(date, profit)| DateProfit { date, profit })
            .collect())
    }

    /// Debit and credit of unaccounted operations per article, ordered by name.
    pub fn unaccounted_totals(&self) -> Result<Vec<ArticleTotals>, EngineError> {
        let names = self.article_names()?;
        let mut per_article: BTreeMap<&str, Totals> = BTreeMap::new();
        let operations = self.storage.list_operations(&OperationFilter::unaccounted())?;
        for op in &operations {
            let name = names.get(&op.article_id).map(String::as_str).unwrap_or_default();
            accumulate(per_article.entry(name).or_default(), op)?;
        }
        Ok(per_article
            .into_iter()
            .map(|(name, totals)| ArticleTotals {
                article_name: name.to_string(),
                debit: totals.debit,
                credit: totals.credit,
            })
            .collect())
    }

    pub fn balance_operation_counts(&self) -> Result<Vec<BalanceOperationCount>, EngineError> {
        let mut counts: HashMap<BalanceId, i64> = HashMap::new();
        for op in self.storage.list_operations(&OperationFilter::all())? {
            if let Some(id) = op.balance_id {
                *counts.entry(id).or_default() += 1;
            }
        }
        Ok(self
            .balances()?
            .into_iter()
            .map(|b| BalanceOperationCount {
                balance_id: b.id,
                date: b.date,
                operation_count: counts.get(&b.id).copied().unwrap_or(0),
            })
            .collect())
    }

    /// Operations of the latest balance (latest date, then highest id) with
    /// their profit. Empty when no balance exists.
    pub fn last_balance_operations(&self) -> Result<Vec<OperationProfit>, EngineError> {
        let latest = self
            .balances()?
            .into_iter()
            .max_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        let Some(balance) = latest else {
            return Ok(Vec::new());
        };

        let names = self.article_names()?;
        Ok(self
            .storage
            .list_operations(&OperationFilter::for_balance(balance.id))?
            .into_iter()
            .map(|op| OperationProfit {
                operation_id: op.id,
                article_name: names.get(&op.article_id).cloned().unwrap_or_default(),
                date: op.date,
                debit: op.debit,
                credit: op.credit,
                profit: op.profit(),
            })
            .collect())
    }

    /// Balances in which `first` made more profit than `second`. Balances
    /// lacking operations of either article are skipped.
    pub fn balances_with_profit_comparison(
        &self,
        first: &str,
        second: &str,
    ) -> Result<Vec<BalanceProfitComparison>, EngineError> {
        let first = self.require_article(first)?;
        let second = self.require_article(second)?;
        let first_profits = profit_per_balance(
            &self.storage.list_operations(&OperationFilter::for_article(first.id))?,
        )?;
        let second_profits = profit_per_balance(
            &self.storage.list_operations(&OperationFilter::for_article(second.id))?,
        )?;

        Ok(self
            .balances()?
            .into_iter()
            .filter_map(|b| {
                let first_profit = *first_profits.get(&b.id)?;
                let second_profit = *second_profits.get(&b.id)?;
                (first_profit > second_profit).then_some(BalanceProfitComparison {
                    balance_id: b.id,
                    date: b.date,
                    first_profit,
                    second_profit,
                })
            })
            .collect())
    }

    /// Article with the greatest total credit inside the balance. Ties go to
    /// the alphabetically first article.
    pub fn article_with_max_expenses(&self, balance_id: BalanceId) -> Result<Article, EngineError> {
        if self.storage.get_balance(balance_id)?.is_none() {
            return Err(EngineError::NotFound(format!("balance #{}", balance_id)));
        }
        let mut credit: HashMap<ArticleId, Decimal> = HashMap::new();
        for op in self.storage.list_operations(&OperationFilter::for_balance(balance_id))? {
            let total = credit.entry(op.article_id).or_default();
            *total = total
                .checked_add(op.credit)
                .ok_or_else(|| overflow(&format!("credit in balance #{}", balance_id)))?;
        }

        self.articles()?
            .into_iter()
            .filter_map(|a| credit.get(&a.id).map(|c| (*c, a)))
            .max_by(|(ca, a), (cb, b)| ca.cmp(cb).then(b.name.cmp(&a.name)))
            .map(|(_, article)| article)
            .ok_or_else(|| EngineError::NotFound(format!("operations in balance #{}", balance_id)))
    }

    /// Balances whose stored aggregates disagree with the sums over their
    /// linked operations. Empty on a healthy ledger.
    pub fn inconsistent_balances(&self) -> Result<Vec<Balance>, EngineError> {
        let mut linked: HashMap<BalanceId, Vec<Operation>> = HashMap::new();
        for op in self.storage.list_operations(&OperationFilter::all())? {
            if let Some(id) = op.balance_id {
                linked.entry(id).or_default().push(op);
            }
        }
        Ok(self
            .balances()?
            .into_iter()
            .filter(|b| {
                // sums that overflow can never match a stored aggregate
                let expected = Totals::of(linked.get(&b.id).into_iter().flatten());
                expected != Some(b.totals()) || b.amount != b.debit - b.credit
            })
            .collect())
    }

    pub fn run(&self, query: &ReportQuery) -> Result<ReportValue, EngineError> {
        tracing::debug!(?query, "Running report");
        Ok(match query {
            ReportQuery::Articles => ReportValue::Articles(self.articles()?),
            ReportQuery::Operations => ReportValue::Operations(self.operations()?),
            ReportQuery::Balances => ReportValue::Balances(self.balances()?),
            ReportQuery::UnusedArticles { range } => ReportValue::Articles(self.unused_articles(*range)?),
            ReportQuery::ArticleOperations => ReportValue::ArticleOperations(self.articles_with_operations()?),
            ReportQuery::Profit { article, range } => ReportValue::Money(self.profit_by_article(article, *range)?),
            ReportQuery::Credit { article, range } => {
                ReportValue::Money(self.total_credit_by_article(article, *range)?)
            }
            ReportQuery::BalanceCount { article } => ReportValue::Count(self.balance_count_for_article(article)?),
            ReportQuery::Dynamics { range, articles } => {
                ReportValue::Dynamics(self.income_expense_dynamics(articles, *range)?)
            }
            ReportQuery::Shares { range, flow, articles } => {
                ReportValue::Shares(self.financial_percentages(articles, *flow, *range)?)
            }
            ReportQuery::ProfitOverTime { range } => ReportValue::ProfitOverTime(self.total_profit_over_time(*range)?),
            ReportQuery::Unaccounted => ReportValue::ArticleTotals(self.unaccounted_totals()?),
            ReportQuery::BalanceCounts => ReportValue::BalanceCounts(self.balance_operation_counts()?),
            ReportQuery::LastBalance => ReportValue::OperationProfits(self.last_balance_operations()?),
            ReportQuery::CompareProfit { first, second } => {
                ReportValue::ProfitComparison(self.balances_with_profit_comparison(first, second)?)
            }
            ReportQuery::MaxExpenses { balance_id } => {
                ReportValue::Name(self.article_with_max_expenses(*balance_id)?.name)
            }
        })
    }

    fn require_article(&self, name: &str) -> Result<Article, EngineError> {
        self.storage
            .find_article(name)?
            .ok_or_else(|| EngineError::NotFound(format!("article '{}'", name)))
    }

    fn select_articles(&self, names: &[String]) -> Result<Vec<Article>, EngineError> {
        if names.is_empty() {
            return self.articles();
        }
        names.iter().map(|name| self.require_article(name)).collect()
    }

    fn selected_operations(&self, selected: &[Article], range: DateRange) -> Result<Vec<Operation>, EngineError> {
        Ok(self
            .storage
            .list_operations(&OperationFilter::in_range(range))?
            .into_iter()
            .filter(|op| selected.iter().any(|a| a.id == op.article_id))
            .collect())
    }

    fn article_names(&self) -> Result<HashMap<ArticleId, String>, EngineError> {
        Ok(self.articles()?.into_iter().map(|a| (a.id, a.name)).collect())
    }

    fn operations_by_article(&self, filter: &OperationFilter) -> Result<HashMap<ArticleId, Vec<Operation>>, EngineError> {
        let mut grouped: HashMap<ArticleId, Vec<Operation>> = HashMap::new();
        for op in self.storage.list_operations(filter)? {
            grouped.entry(op.article_id).or_default().push(op);
        }
        Ok(grouped)
    }

    fn accounted_totals(&self, article: &str, range: DateRange) -> Result<Totals, EngineError> {
        check_range(range)?;
        let article = self.require_article(article)?;
        let closing: HashMap<BalanceId, Date> = self.balances()?.into_iter().map(|b| (b.id, b.date)).collect();
        let operations = self.storage.list_operations(&OperationFilter::for_article(article.id))?;
        Totals::of(operations.iter().filter(|op| {
            op.balance_id
                .and_then(|id| closing.get(&id))
                .map_or(false, |date| range.contains(*date))
        }))
        .ok_or_else(|| overflow(&format!("totals of '{}'", article.name)))
    }
}

fn accumulate(totals: &mut Totals, op: &Operation) -> Result<(), EngineError> {
    *totals = totals
        .checked_add(op.debit, op.credit)
        .ok_or_else(|| overflow(&format!("totals on {}", op.date)))?;
    Ok(())
}

// Scaling first keeps precision; huge shares fall back to dividing first.
fn percent_of(value: Decimal, total: Decimal) -> Decimal {
    if total.is_zero() {
        return Decimal::ZERO;
    }
    match value.checked_mul(Decimal::ONE_HUNDRED) {
        Some(scaled) => scaled.checked_div(total),
        None => value.checked_div(total).and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED)),
    }
    .unwrap_or_default()
    .round_dp(2)
}

fn profit_per_balance(operations: &[Operation]) -> Result<HashMap<BalanceId, Decimal>, EngineError> {
    let mut profits: HashMap<BalanceId, Decimal> = HashMap::new();
    for op in operations {
        if let Some(id) = op.balance_id {
            let profit = profits.entry(id).or_default();
            *profit = profit
                .checked_add(op.profit())
                .ok_or_else(|| overflow(&format!("profit in balance #{}", id)))?;
        }
    }
    Ok(profits)
}

/// Report selectable from the command line.
#[derive(Subcommand, Debug, Clone)]
pub enum ReportQuery {
    Articles,
    Operations,
    Balances,
    /// Articles without operations in the period
    UnusedArticles { range: DateRange },
    /// Articles joined with their operations
    ArticleOperations,
    /// Accounted profit of an article over balances closing in the period
    Profit { article: String, range: DateRange },
    /// Accounted credit of an article over balances closing in the period
    Credit { article: String, range: DateRange },
    /// Number of balances referencing an article
    BalanceCount { article: String },
    /// Debit and credit per date
    Dynamics {
        range: DateRange,
        #[arg(long = "article")]
        articles: Vec<String>,
    },
    /// Percentage breakdown of a flow across articles
    Shares {
        range: DateRange,
        #[arg(long, default_value = "expense")]
        flow: FlowKind,
        #[arg(long = "article")]
        articles: Vec<String>,
    },
    /// Profit per date
    ProfitOverTime { range: DateRange },
    /// Totals of operations not yet in a balance
    Unaccounted,
    /// Operation count per balance
    BalanceCounts,
    /// Operations of the latest balance
    LastBalance,
    /// Balances where the first article out-earned the second
    CompareProfit { first: String, second: String },
    /// Article with the largest expenses inside a balance
    MaxExpenses { balance_id: BalanceId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use budgetdb_core::NewOperation;
    use budgetdb_sqlite::SqliteStorage;
    use rust_decimal_macros::dec;
    use time::macros::date;

    struct Fixture {
        store: Arc<dyn LedgerStore>,
        reports: LedgerReports,
    }

    impl Fixture {
        fn new() -> Self {
            let store: Arc<dyn LedgerStore> = Arc::new(SqliteStorage::new(":memory:").unwrap());
            Self {
                reports: LedgerReports::new(store.clone()),
                store,
            }
        }

        fn article(&self, name: &str) -> ArticleId {
            self.store.insert_article(name).unwrap().id
        }

        fn op(&self, article_id: ArticleId, debit: Decimal, credit: Decimal, date: Date, balance_id: Option<BalanceId>) {
            self.store
                .insert_operation(&NewOperation {
                    article_id,
                    debit,
                    credit,
                    date,
                    balance_id,
                })
                .unwrap();
        }

        fn balance(&self, date: Date, debit: Decimal, credit: Decimal) -> BalanceId {
            self.store.insert_balance(date, &Totals { debit, credit }).unwrap().id
        }
    }

    fn november() -> DateRange {
        DateRange::new(date!(2024 - 11 - 01), date!(2024 - 11 - 30))
    }

    #[test]
    fn test_unused_articles_range_is_inclusive() {
        let f = Fixture::new();
        let food = f.article("food");
        let salary = f.article("salary");
        f.article("rent");
        f.op(food, dec!(0), dec!(10), date!(2024 - 11 - 30), None);
        f.op(salary, dec!(100), dec!(0), date!(2024 - 12 - 01), None);

        let unused: Vec<String> = f.reports.unused_articles(november()).unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(unused, vec!["salary", "rent"]);
    }

    #[test]
    fn test_profit_and_credit_use_balance_date() {
        let f = Fixture::new();
        let food = f.article("food");
        let nov = f.balance(date!(2024 - 11 - 30), dec!(50), dec!(30));
        let dec_balance = f.balance(date!(2024 - 12 - 31), dec!(0), dec!(5));
        f.op(food, dec!(50), dec!(30), date!(2024 - 11 - 10), Some(nov));
        f.op(food, dec!(0), dec!(5), date!(2024 - 12 - 10), Some(dec_balance));
        // unaccounted operations are ignored
        f.op(food, dec!(0), dec!(1000), date!(2024 - 11 - 11), None);

        assert_eq!(f.reports.profit_by_article("food", november()).unwrap(), dec!(20));
        assert_eq!(f.reports.total_credit_by_article("food", november()).unwrap(), dec!(30));
        let december = DateRange::new(date!(2024 - 12 - 01), date!(2024 - 12 - 31));
        assert_eq!(f.reports.total_credit_by_article("food", december).unwrap(), dec!(5));
        let empty = DateRange::new(date!(2023 - 01 - 01), date!(2023 - 01 - 31));
        assert_eq!(f.reports.total_credit_by_article("food", empty).unwrap(), Decimal::ZERO);
        assert!(matches!(
            f.reports.profit_by_article("travel", november()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_balance_count_for_article_counts_distinct_balances() {
        let f = Fixture::new();
        let food = f.article("food");
        f.article("rent");
        let b1 = f.balance(date!(2024 - 10 - 31), dec!(0), dec!(0));
        let b2 = f.balance(date!(2024 - 11 - 30), dec!(0), dec!(0));
        f.op(food, dec!(0), dec!(1), date!(2024 - 10 - 02), Some(b1));
        f.op(food, dec!(0), dec!(1), date!(2024 - 10 - 03), Some(b1));
        f.op(food, dec!(0), dec!(1), date!(2024 - 11 - 03), Some(b2));
        f.op(food, dec!(0), dec!(1), date!(2024 - 12 - 03), None);

        assert_eq!(f.reports.balance_count_for_article("food").unwrap(), 2);
        assert_eq!(f.reports.balance_count_for_article("rent").unwrap(), 0);
    }

    #[test]
    fn test_income_expense_dynamics_groups_by_date() {
        let f = Fixture::new();
        let food = f.article("food");
        let salary = f.article("salary");
        f.op(food, dec!(0), dec!(10), date!(2024 - 11 - 05), None);
        f.op(salary, dec!(500), dec!(0), date!(2024 - 11 - 05), None);
        f.op(food, dec!(0), dec!(7.25), date!(2024 - 11 - 02), None);

        let all = f.reports.income_expense_dynamics(&[], november()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].date, date!(2024 - 11 - 02));
        assert_eq!((all[1].debit, all[1].credit), (dec!(500), dec!(10)));

        let only_food = f.reports.income_expense_dynamics(&["food".to_string()], november()).unwrap();
        assert_eq!(only_food[1].debit, Decimal::ZERO);
        assert!(f.reports.income_expense_dynamics(&["nope".to_string()], november()).is_err());
    }

    #[test]
    fn test_financial_percentages() {
        let f = Fixture::new();
        let food = f.article("food");
        let rent = f.article("rent");
        let fun = f.article("fun");
        f.op(food, dec!(0), dec!(100), date!(2024 - 11 - 05), None);
        f.op(rent, dec!(0), dec!(200), date!(2024 - 11 - 06), None);
        f.op(fun, dec!(0), dec!(0), date!(2024 - 11 - 07), None);

        let shares = f.reports.financial_percentages(&[], FlowKind::Expense, november()).unwrap();
        let percents: Vec<(String, Decimal)> = shares.into_iter().map(|s| (s.article_name, s.percent)).collect();
        assert_eq!(
            percents,
            vec![
                ("food".to_string(), dec!(33.33)),
                ("fun".to_string(), dec!(0)),
                ("rent".to_string(), dec!(66.67)),
            ]
        );

        // zero total yields zero shares
        let income = f.reports.financial_percentages(&[], FlowKind::Income, november()).unwrap();
        assert!(income.iter().all(|s| s.percent.is_zero()));
    }

    #[test]
    fn test_total_profit_over_time() {
        let f = Fixture::new();
        let food = f.article("food");
        f.op(food, dec!(10), dec!(4), date!(2024 - 11 - 03), None);
        f.op(food, dec!(0), dec!(1), date!(2024 - 11 - 03), None);
        f.op(food, dec!(2), dec!(0), date!(2024 - 11 - 01), None);

        let rows = f.reports.total_profit_over_time(november()).unwrap();
        assert_eq!(
            rows,
            vec![
                DateProfit { date: date!(2024 - 11 - 01), profit: dec!(2) },
                DateProfit { date: date!(2024 - 11 - 03), profit: dec!(5) },
            ]
        );
    }

    #[test]
    fn test_last_balance_and_counts() {
        let f = Fixture::new();
        let food = f.article("food");
        let older = f.balance(date!(2024 - 10 - 31), dec!(0), dec!(3));
        let latest = f.balance(date!(2024 - 11 - 30), dec!(9), dec!(0));
        f.op(food, dec!(0), dec!(3), date!(2024 - 10 - 01), Some(older));
        f.op(food, dec!(9), dec!(0), date!(2024 - 11 - 01), Some(latest));

        let last = f.reports.last_balance_operations().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].profit, dec!(9));
        assert_eq!(last[0].article_name, "food");

        let counts = f.reports.balance_operation_counts().unwrap();
        assert_eq!(counts.iter().map(|c| c.operation_count).collect::<Vec<_>>(), vec![1, 1]);
    }

    #[test]
    fn test_profit_comparison_skips_balances_missing_an_article() {
        let f = Fixture::new();
        let salary = f.article("salary");
        let food = f.article("food");
        let b1 = f.balance(date!(2024 - 10 - 31), dec!(0), dec!(0));
        let b2 = f.balance(date!(2024 - 11 - 30), dec!(0), dec!(0));
        f.op(salary, dec!(100), dec!(0), date!(2024 - 10 - 01), Some(b1));
        f.op(food, dec!(0), dec!(20), date!(2024 - 10 - 02), Some(b1));
        f.op(salary, dec!(100), dec!(0), date!(2024 - 11 - 01), Some(b2));

        let rows = f.reports.balances_with_profit_comparison("salary", "food").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance_id, b1);
        assert_eq!(rows[0].second_profit, dec!(-20));
        assert!(f.reports.balances_with_profit_comparison("food", "salary").unwrap().is_empty());
    }

    #[test]
    fn test_article_with_max_expenses() {
        let f = Fixture::new();
        let food = f.article("food");
        let rent = f.article("rent");
        let b = f.balance(date!(2024 - 11 - 30), dec!(0), dec!(0));
        f.op(food, dec!(0), dec!(40), date!(2024 - 11 - 01), Some(b));
        f.op(food, dec!(0), dec!(40), date!(2024 - 11 - 02), Some(b));
        f.op(rent, dec!(0), dec!(70), date!(2024 - 11 - 03), Some(b));

        assert_eq!(f.reports.article_with_max_expenses(b).unwrap().name, "food");

        let empty = f.balance(date!(2024 - 12 - 31), dec!(0), dec!(0));
        assert!(matches!(f.reports.article_with_max_expenses(empty), Err(EngineError::NotFound(_))));
        assert!(matches!(f.reports.article_with_max_expenses(999), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_inconsistent_balances_detects_drift() {
        let f = Fixture::new();
        let food = f.article("food");
        let good = f.balance(date!(2024 - 10 - 31), dec!(0), dec!(5));
        let bad = f.balance(date!(2024 - 11 - 30), dec!(0), dec!(1));
        f.op(food, dec!(0), dec!(5), date!(2024 - 10 - 01), Some(good));
        f.op(food, dec!(0), dec!(2), date!(2024 - 11 - 01), Some(bad));

        let drifted: Vec<BalanceId> = f.reports.inconsistent_balances().unwrap().iter().map(|b| b.id).collect();
        assert_eq!(drifted, vec![bad]);
    }

    #[test]
    fn test_articles_with_operations_includes_empty_articles() {
        let f = Fixture::new();
        let food = f.article("food");
        f.article("books");
        f.op(food, dec!(0), dec!(2), date!(2024 - 11 - 02), None);
        f.op(food, dec!(0), dec!(1), date!(2024 - 11 - 01), None);

        let rows = f.reports.articles_with_operations().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].article_name, "books");
        assert_eq!(rows[0].operation_id, None);
        assert_eq!(rows[1].date, Some(date!(2024 - 11 - 01)));
    }

    #[test]
    fn test_run_dispatches_queries() {
        let f = Fixture::new();
        f.article("food");
        match f.reports.run(&ReportQuery::Articles).unwrap() {
            ReportValue::Articles(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected report: {:?}", other),
        }
        assert_eq!(
            f.reports.run(&ReportQuery::BalanceCount { article: "food".to_string() }).unwrap(),
            ReportValue::Count(0)
        );
    }

    #[test]
    fn test_sums_beyond_decimal_range_are_rejected() {
        let f = Fixture::new();
        let salary = f.article("salary");
        let b = f.balance(date!(2024 - 11 - 30), dec!(0), dec!(0));
        f.op(salary, Decimal::MAX, dec!(0), date!(2024 - 11 - 05), Some(b));
        f.op(salary, Decimal::MAX, dec!(0), date!(2024 - 11 - 05), Some(b));

        assert!(matches!(
            f.reports.income_expense_dynamics(&[], november()),
            Err(EngineError::ConstraintViolation(_))
        ));
        assert!(matches!(
            f.reports.total_profit_over_time(november()),
            Err(EngineError::ConstraintViolation(_))
        ));
        assert!(matches!(
            f.reports.profit_by_article("salary", november()),
            Err(EngineError::ConstraintViolation(_))
        ));
        assert!(matches!(f.reports.unaccounted_totals(), Ok(rows) if rows.is_empty()));
        // the stored zero aggregate cannot match an overflowing sum
        assert_eq!(f.reports.inconsistent_balances().unwrap().len(), 1);
    }

    #[test]
    fn test_large_share_still_gets_a_percentage() {
        let f = Fixture::new();
        let salary = f.article("salary");
        f.op(salary, Decimal::MAX, dec!(0), date!(2024 - 11 - 05), None);

        let shares = f.reports.financial_percentages(&[], FlowKind::Income, november()).unwrap();
        assert_eq!(shares[0].percent, dec!(100));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let f = Fixture::new();
        f.article("food");
        let backwards = DateRange::new(date!(2024 - 11 - 30), date!(2024 - 11 - 01));

        for result in [
            f.reports.unused_articles(backwards).map(|_| ()),
            f.reports.profit_by_article("food", backwards).map(|_| ()),
            f.reports.income_expense_dynamics(&[], backwards).map(|_| ()),
            f.reports.financial_percentages(&[], FlowKind::Expense, backwards).map(|_| ()),
            f.reports.total_profit_over_time(backwards).map(|_| ()),
        ] {
            assert!(matches!(result, Err(EngineError::ConstraintViolation(_))));
        }
    }
}
