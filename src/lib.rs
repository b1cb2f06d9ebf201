//! BudgetDB: a home-budget ledger with monthly balance closing.
//!
//! The [`engine`] owns every mutation and keeps balance aggregates equal to
//! the sums over their linked operations. [`reports`] answers read-only
//! queries, [`api`] exposes both over HTTP.

pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod reports;
