//! Integration tests for the harvest orchestrator
//!
//! These tests drive the whole orchestrator, with either a scripted fetcher
//! or wiremock standing in for the catalog site.

mod common;
mod http_tests;
mod orchestrator_tests;
mod recovery_tests;
