//! # Data Ingestors Module
//!
//! This module holds everything that brings the remote data file into the
//! agent: finding the newest file on the FTP server, transferring it to local
//! storage, and reading the latest record out of it.
//!
//! ## Contained Modules:
//! - **`file_discovery`**: Lists the remote directory and picks the "latest"
//!   `dayDDMMYY.dat` (or `dayN.dat`) file by the date or index in its name.
//! - **`ftp_source`**: The FTP client. It implements both the directory
//!   listing and the atomic download used by the scheduler.
//! - **`row_extractor`**: Returns the last non-blank line of the downloaded file.
//!
//! Each collaborator sits behind a small async trait (`ListingProvider`,
//! `Downloader`, `RowExtractor`) so the scheduler can be exercised against
//! in-memory stubs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Latest-file selection over a remote directory listing.
pub mod file_discovery;
/// FTP listing and atomic download.
pub mod ftp_source;
/// Last-record extraction from a local text file.
pub mod row_extractor;

// --- Public API Re-exports ---
pub use file_discovery::{Candidate, DiscoveryError, FileDiscovery, ListingProvider, SortKey};
pub use ftp_source::{Downloader, FtpSource, TransferError};
pub use row_extractor::{LastLineExtractor, RowExtractor};
