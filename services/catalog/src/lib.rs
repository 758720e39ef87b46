//! Cafe Catalog Service
//!
//! Moderated catalog of coffee shops. Users propose changes as submissions
//! (new cafes, description edits, cafe and menu photos); moderators approve,
//! reject or send them back. Approval applies the change to the catalog in the
//! same transaction that records the decision.
//!
//! ## Features
//!
//! - **Moderation Workflow**: typed submission payloads, a single-exit
//!   `pending` state and an append-only audit trail
//! - **Staged Photo Uploads**: presigned PUTs under a per-user pending prefix,
//!   HEAD-verified before a submission is accepted
//! - **Photo Optimization**: bounded resize, JPEG/PNG re-encode, canonical
//!   content-addressed keys and responsive width variants
//! - **Alternate Formats**: optional WebP/AVIF variants from an external
//!   encoder service
//!
//! ## Architecture
//!
//! ```text
//!   HTTP clients              PostgreSQL/PostGIS          S3 Bucket
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────────┐
//! │ axum Router  │           │ cafes        │          │ pending/         │
//! │ (api)        │           │ cafe_photos  │          │   submissions/   │
//! └──────────────┘           │ submissions  │          │ cafes/{id}/      │
//!     │      │               │ mod. events  │          │   {kind}/        │
//!     │      ▼               └──────────────┘          │   optimized/     │
//!     │ ┌──────────────┐            ▲                  └──────────────────┘
//!     │ │ Moderation   │────────────┘                       ▲      ▲
//!     │ │ Service      │───── HEAD ─────────────────────────┘      │
//!     │ └──────────────┘                                           │
//!     ▼                                                            │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Upload       │──────────▶│ Photo        │─────────▶│ Variants     │
//! │ Service      │           │ Optimizer    │          │ (+ encoder)  │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!                                   ▲
//!                            ┌──────────────┐
//!                            │ Photo        │
//!                            │ Backfill     │
//!                            └──────────────┘
//! ```

pub mod api;
pub mod backfill;
pub mod catalog_store;
pub mod config;
pub mod encoder;
pub mod error;
pub mod moderation;
pub mod object_store;
pub mod optimizer;
pub mod photo_keys;
pub mod submission_store;
pub mod submissions;
pub mod uploads;
pub mod variants;

pub use api::{create_router, AppState};
pub use backfill::{BackfillSummary, PhotoBackfill};
pub use catalog_store::{CafePhoto, CatalogStore, UserRole};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use moderation::{DecisionOutcome, ModerationService};
pub use object_store::{DisabledObjectStore, ObjectStore, S3ObjectStore};
pub use optimizer::{OptimizeRequest, OptimizedPhoto, PhotoOptimizer};
pub use submissions::{Decision, Submission, SubmissionPayload, SubmissionStatus};
