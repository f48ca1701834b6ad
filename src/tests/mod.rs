//! Consolidated end-to-end tests.
//!
//! Module-level behavior is tested next to each module; the scenarios here
//! exercise full flows through the manager, the axum router, and a
//! wiremock identity provider.
