//! Integration tests module
//!
//! End-to-end tests for the publication engine:
//! - Complete fetch → dedup → emit → persist pipeline
//! - State file migration, recovery and backups
//! - Fixed-slot and pacing schedules
//! - Collaborators against mocked HTTP endpoints
//! - Error handling and recovery scenarios

pub mod collaborators_test;
pub mod error_scenarios;
pub mod fixtures;
pub mod scheduler_test;
pub mod state_store_test;
