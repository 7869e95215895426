#![doc = "repo-cron-core: batch orchestration library for repo-cron."]

//! This crate holds the pipeline itself: input normalization, sharding,
//! queue delivery, the idempotent worker loop, completion detection and the
//! warehouse transfer. Concrete analyzers and warehouse clients live in the
//! `repo-cron` binary crate and plug in through [`contract`].
//!
//! # Usage
//! Depend on this crate for everything shared by the controller, worker and
//! transfer processes.

pub mod auth;
pub mod config;
pub mod contract;
pub mod controller;
pub mod data;
pub mod input;
pub mod queue;
pub mod storage;
pub mod summary;
pub mod transfer;
pub mod worker;
