//! Tipproxy - a self-updating blue-green reverse proxy
//!
//! This library provides a reverse proxy that:
//! - Polls an upstream metadata endpoint for the heads of tracked repositories
//! - Rebuilds the idle side from fresh checkouts whenever those heads move
//! - Swaps traffic to the new build only once its backend is healthy
//! - Keeps serving the previous build when a rebuild fails
//! - Answers a status path from controller state

pub mod builder;
pub mod config;
pub mod controller;
pub mod error;
pub mod git;
pub mod launcher;
pub mod metadata;
pub mod pool;
pub mod proxy;
pub mod signature;
pub mod state;
