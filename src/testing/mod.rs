//! Test helpers and cross-module scenario tests.
//!
//! ```text
//!   utils ──────────────────────────────▶ resharding_e2e_tests
//!   - wait_for_result polling               - up / down lifecycles
//!   - FlakyPointStore                       - aborts, forced aborts, guards
//!     (injected write failures, slow I/O)   - resumable transfers
//!   - bootstrap_cluster                     - concurrent starts
//!     (3 peers, seeded collection)
//! ```

mod resharding_e2e_tests;
pub mod utils;
