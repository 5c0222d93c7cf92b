//! Perp Fleet
//!
//! Event-driven trading engine shared by backtests and live bots, plus an
//! orchestrator that runs many bots concurrently and restores them after a
//! restart.

pub mod backtest;
pub mod bot;
pub mod data;
pub mod db;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod trading;
