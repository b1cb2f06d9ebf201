use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use budgetdb_core::{
    parse_date, period::iso_date, Article, ArticleOperationRow, ArticleShare, ArticleTotals, Balance,
    BalanceId, BalanceOperationCount, BalanceProfitComparison, DateProfit, DateRange, DateTotals,
    FlowKind, Operation, OperationId, OperationProfit,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

use crate::{
    auth::{auth_middleware, AuthState, CallerIdentity},
    engine::{BalanceEngine, EngineError, OperationInput, OperationUpdate},
    reports::LedgerReports,
};

pub struct AppState {
    pub engine: BalanceEngine,
    pub reports: LedgerReports,
    pub metrics: Option<PrometheusHandle>,
}

/// JSON envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::BelowMinimumProfit { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::ConstraintViolation(_) => StatusCode::CONFLICT,
                EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                EngineError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        metrics::counter!("budgetdb_http_errors_total", 1, "status" => status.as_u16().to_string());

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Engine and report calls hit SQLite synchronously, so they run on the
/// blocking pool instead of an async worker.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> Result<T, EngineError> + Send + 'static,
{
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| EngineError::Transport(format!("ledger task failed: {}", e)))?;
    Ok(result?)
}

pub fn router(state: Arc<AppState>, auth: Arc<AuthState>) -> Router {
    let protected = Router::new()
        .route("/articles", get(list_articles).post(create_article))
        .route("/articles/:name", put(rename_article).delete(delete_article))
        .route("/articles/:name/increase-expenses", post(increase_expenses))
        .route("/operations", get(list_operations).post(create_operation))
        .route("/operations/:id", put(update_operation).delete(delete_operation))
        .route("/balances", get(list_balances).post(create_balance))
        .route("/balances/most-unprofitable", delete(delete_most_unprofitable))
        .route("/balances/by-date/:date", delete(delete_balance_by_date))
        .route("/reports/unused-articles", get(unused_articles))
        .route("/reports/article-operations", get(article_operations))
        .route("/reports/profit", get(profit_by_article))
        .route("/reports/credit", get(credit_by_article))
        .route("/reports/balance-count", get(balance_count))
        .route("/reports/dynamics", get(dynamics))
        .route("/reports/shares", get(shares))
        .route("/reports/profit-over-time", get(profit_over_time))
        .route("/reports/unaccounted", get(unaccounted))
        .route("/reports/balance-counts", get(balance_counts))
        .route("/reports/last-balance", get(last_balance))
        .route("/reports/compare-profit", get(compare_profit))
        .route("/reports/max-expenses/:balance_id", get(max_expenses))
        .route("/reports/inconsistent-balances", get(inconsistent_balances))
        .route_layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(protected)
        .layer(Extension(auth))
        .with_state(state)
}

async fn health() -> Json<ApiResponse<&'static str>> {
    ok("ok")
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ---- articles ----

#[derive(Debug, Deserialize)]
struct ArticleBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AmountBody {
    amount: Decimal,
}

#[derive(Debug, Serialize)]
struct Changed {
    changed: usize,
}

async fn list_articles(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Article>> {
    Ok(ok(blocking(&state, |s| s.reports.articles()).await?))
}

async fn create_article(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Json(body): Json<ArticleBody>,
) -> Result<(StatusCode, Json<ApiResponse<Article>>), ApiError> {
    let article = blocking(&state, move |s| s.engine.add_article(&caller, &body.name)).await?;
    Ok((StatusCode::CREATED, ok(article)))
}

async fn rename_article(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(name): Path<String>,
    Json(body): Json<ArticleBody>,
) -> ApiResult<()> {
    blocking(&state, move |s| s.engine.rename_article(&caller, &name, &body.name)).await?;
    Ok(ok(()))
}

async fn delete_article(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(name): Path<String>,
) -> ApiResult<Vec<BalanceId>> {
    Ok(ok(
        blocking(&state, move |s| s.engine.delete_article_and_recalculate_balances(&caller, &name)).await?,
    ))
}

async fn increase_expenses(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(name): Path<String>,
    Json(body): Json<AmountBody>,
) -> ApiResult<Changed> {
    let changed = blocking(&state, move |s| {
        s.engine.increase_expenses_for_article(&caller, &name, body.amount)
    })
    .await?;
    Ok(ok(Changed { changed }))
}

// ---- operations ----

async fn list_operations(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Operation>> {
    Ok(ok(blocking(&state, |s| s.reports.operations()).await?))
}

async fn create_operation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Json(input): Json<OperationInput>,
) -> Result<(StatusCode, Json<ApiResponse<Operation>>), ApiError> {
    let operation = blocking(&state, move |s| s.engine.add_operation(&caller, &input)).await?;
    Ok((StatusCode::CREATED, ok(operation)))
}

async fn update_operation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<OperationId>,
    Json(update): Json<OperationUpdate>,
) -> ApiResult<Operation> {
    Ok(ok(blocking(&state, move |s| s.engine.update_operation(&caller, id, &update)).await?))
}

async fn delete_operation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<OperationId>,
) -> ApiResult<Operation> {
    Ok(ok(blocking(&state, move |s| s.engine.delete_operation(&caller, id)).await?))
}

// ---- balances ----

#[derive(Debug, Deserialize)]
struct CloseBalanceBody {
    #[serde(with = "iso_date")]
    start: Date,
    #[serde(with = "iso_date")]
    end: Date,
    #[serde(default)]
    min_profit: Decimal,
}

async fn list_balances(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Balance>> {
    Ok(ok(blocking(&state, |s| s.reports.balances()).await?))
}

async fn create_balance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Json(body): Json<CloseBalanceBody>,
) -> Result<(StatusCode, Json<ApiResponse<Balance>>), ApiError> {
    let range = DateRange::new(body.start, body.end);
    let balance = blocking(&state, move |s| {
        s.engine.create_balance_if_profitable(&caller, range, body.min_profit)
    })
    .await?;
    Ok((StatusCode::CREATED, ok(balance)))
}

async fn delete_most_unprofitable(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
) -> ApiResult<Balance> {
    Ok(ok(blocking(&state, move |s| s.engine.delete_most_unprofitable_balance(&caller)).await?))
}

async fn delete_balance_by_date(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(date): Path<String>,
) -> ApiResult<Vec<Balance>> {
    let date = parse_date(&date).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(ok(blocking(&state, move |s| s.engine.delete_balance_by_date(&caller, date)).await?))
}

// ---- reports ----

#[derive(Debug, Deserialize)]
struct ArticleRangeQuery {
    article: String,
    #[serde(with = "iso_date")]
    start: Date,
    #[serde(with = "iso_date")]
    end: Date,
}

impl ArticleRangeQuery {
    fn range(&self) -> DateRange {
        DateRange::new(self.start, self.end)
    }
}

#[derive(Debug, Deserialize)]
struct ArticleQuery {
    article: String,
}

/// Period plus an optional comma-separated article list.
#[derive(Debug, Deserialize)]
struct SelectionQuery {
    #[serde(with = "iso_date")]
    start: Date,
    #[serde(with = "iso_date")]
    end: Date,
    #[serde(default)]
    articles: Option<String>,
    #[serde(default)]
    flow: Option<FlowKind>,
}

impl SelectionQuery {
    fn range(&self) -> DateRange {
        DateRange::new(self.start, self.end)
    }

    fn articles(&self) -> Vec<String> {
        self.articles
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct CompareQuery {
    first: String,
    second: String,
}

async fn unused_articles(State(state): State<Arc<AppState>>, Query(range): Query<DateRange>) -> ApiResult<Vec<Article>> {
    Ok(ok(blocking(&state, move |s| s.reports.unused_articles(range)).await?))
}

async fn article_operations(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ArticleOperationRow>> {
    Ok(ok(blocking(&state, |s| s.reports.articles_with_operations()).await?))
}

async fn profit_by_article(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ArticleRangeQuery>,
) -> ApiResult<Decimal> {
    Ok(ok(blocking(&state, move |s| s.reports.profit_by_article(&q.article, q.range())).await?))
}

async fn credit_by_article(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ArticleRangeQuery>,
) -> ApiResult<Decimal> {
    Ok(ok(blocking(&state, move |s| s.reports.total_credit_by_article(&q.article, q.range())).await?))
}

async fn balance_count(State(state): State<Arc<AppState>>, Query(q): Query<ArticleQuery>) -> ApiResult<i64> {
    Ok(ok(blocking(&state, move |s| s.reports.balance_count_for_article(&q.article)).await?))
}

async fn dynamics(State(state): State<Arc<AppState>>, Query(q): Query<SelectionQuery>) -> ApiResult<Vec<DateTotals>> {
    Ok(ok(blocking(&state, move |s| s.reports.income_expense_dynamics(&q.articles(), q.range())).await?))
}

async fn shares(State(state): State<Arc<AppState>>, Query(q): Query<SelectionQuery>) -> ApiResult<Vec<ArticleShare>> {
    let flow = q.flow.unwrap_or(FlowKind::Expense);
    Ok(ok(
        blocking(&state, move |s| s.reports.financial_percentages(&q.articles(), flow, q.range())).await?,
    ))
}

async fn profit_over_time(
    State(state): State<Arc<AppState>>,
    Query(range): Query<DateRange>,
) -> ApiResult<Vec<DateProfit>> {
    Ok(ok(blocking(&state, move |s| s.reports.total_profit_over_time(range)).await?))
}

async fn unaccounted(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ArticleTotals>> {
    Ok(ok(blocking(&state, |s| s.reports.unaccounted_totals()).await?))
}

async fn balance_counts(State(state): State<Arc<AppState>>) -> ApiResult<Vec<BalanceOperationCount>> {
    Ok(ok(blocking(&state, |s| s.reports.balance_operation_counts()).await?))
}

async fn last_balance(State(state): State<Arc<AppState>>) -> ApiResult<Vec<OperationProfit>> {
    Ok(ok(blocking(&state, |s| s.reports.last_balance_operations()).await?))
}

async fn compare_profit(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CompareQuery>,
) -> ApiResult<Vec<BalanceProfitComparison>> {
    Ok(ok(
        blocking(&state, move |s| s.reports.balances_with_profit_comparison(&q.first, &q.second)).await?,
    ))
}

async fn max_expenses(State(state): State<Arc<AppState>>, Path(balance_id): Path<BalanceId>) -> ApiResult<Article> {
    Ok(ok(blocking(&state, move |s| s.reports.article_with_max_expenses(balance_id)).await?))
}

async fn inconsistent_balances(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Balance>> {
    Ok(ok(blocking(&state, |s| s.reports.inconsistent_balances()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ApiError::from(EngineError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (
                ApiError::from(EngineError::BelowMinimumProfit {
                    profit: dec!(300),
                    minimum: dec!(1000),
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ApiError::from(EngineError::ConstraintViolation("x".into())), StatusCode::CONFLICT),
            (ApiError::from(EngineError::PermissionDenied("x".into())), StatusCode::FORBIDDEN),
            (ApiError::from(EngineError::Transport("x".into())), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status);
        }
    }

    #[test]
    fn test_selection_query_splits_articles() {
        let q = SelectionQuery {
            start: time::macros::date!(2024 - 11 - 01),
            end: time::macros::date!(2024 - 11 - 30),
            articles: Some("food, rent,,".to_string()),
            flow: None,
        };
        assert_eq!(q.articles(), vec!["food".to_string(), "rent".to_string()]);
        assert_eq!(q.range().end, time::macros::date!(2024 - 11 - 30));
    }

    #[test]
    fn test_envelope_omits_empty_fields() {
        let json = serde_json::to_value(ok(5).0).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": 5}));
    }
}
