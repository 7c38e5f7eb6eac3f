//! Field Reconciliation Service - matches field-collected payments to the accounting books.

pub mod config;
pub mod dtos;
pub mod error;
pub mod feeds;
pub mod handlers;
pub mod matching;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
