//! News source scrapers.
//!
//! Each scraper follows the same two-phase pattern:
//!
//! 1. **Discovery**: produce the article URLs published on a given date
//! 2. **Fetching**: download the raw article page for upload
//!
//! # Supported Sources
//!
//! | Source | Module | Discovery | Notes |
//! |--------|--------|-----------|-------|
//! | Ming Pao Canada (Toronto) | [`mingpao`] | Daily index page, brute-force fallback | Plain HTTP only |
//!
//! Failed probes and fetches are logged; a date whose discovery fails
//! entirely is skipped by the orchestrator rather than aborting the run.

pub mod mingpao;
