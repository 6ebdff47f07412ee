//! Partition lease coordination for the consumer groups of a Hadron topic.
//!
//! The `lock` module assigns the partitions of a topic to the members of consumer groups,
//! guaranteeing that a partition is held by at most one member of a group at any instant. The
//! `reader` module runs the read & cursor commit loop of a single partition, and `member` wires
//! the two together.

pub mod app;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod database;
pub mod distributor;
#[cfg(test)]
mod distributor_test;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod lock;
pub mod member;
pub mod models;
pub mod reader;
pub mod server;
pub mod storage;
pub mod utils;
