//! A tiered content cache and asynchronous loader for remotely fetched assets.
//!
//! The [`Engine`](services::Engine) ties all pieces together: a priority-weighted in-memory tier,
//! a persistent on-disk LRU tier, a deduplicating [`PriorityLoader`](loader::PriorityLoader) with
//! a per-key [`LoadStateMachine`](loader::LoadStateMachine), a speculative
//! [`Preloader`](preload::Preloader) and an admission-controlled
//! [`BatchDownloader`](download::batch::BatchDownloader).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod loader;
pub mod logging;
pub mod preload;
pub mod services;
pub mod types;
pub mod utils;
