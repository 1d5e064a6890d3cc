//! Files written after a run.
//!
//! # Submodules
//!
//! - [`json`]: the run summary as a JSON report
//! - [`indexes`]: static HTML listings of every successfully archived article
//!
//! # Output Structure
//!
//! ```text
//! work_dir/
//! ├── archive_progress.db
//! ├── archiver.log
//! ├── reports/
//! │   └── 20250101_20250131.json
//! └── index/
//!     ├── index.html              # all containers
//!     └── prefix-2025-01.html     # one page per container
//! ```

pub mod indexes;
pub mod json;
