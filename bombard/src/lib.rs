//! Bombard — a load generator for HTTP APIs that follows request chains.
//!
//! A campaign describes requests as templates. A response can feed values
//! back into a shared supply (`extract`), fire other templates (`reload`) or
//! run a small JavaScript snippet that does both. The engine keeps a fixed
//! set of workers busy until every chained request has been answered, then
//! summarizes the run.
//!
//! # Architecture
//!
//! - [`WorkerPool`]: tokio workers over one unbounded queue. It returns from
//!   `start` only when nothing is queued and nothing is in flight, so jobs
//!   that enqueue more jobs are waited for.
//! - [`Bombardier`]: the worker body. Substitutes `{placeholders}` from the
//!   [`SupplyContext`], dispatches through a [`Transport`], classifies the
//!   status and follows `extract`, `reload` and `script`.
//! - [`Metric`] / [`Aggregate`] / [`Summary`]: every attempt becomes an
//!   [`metric::Outcome`], collected in order by the [`Reporter`] and turned
//!   into a [`Summary`] at the end.
//! - [`Campaign`]: the YAML request table.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bombard::{Bombardier, Campaign, HttpTransport, RunArgs, StdoutSink, report::ReportSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let campaign = Campaign::load("campaigns/chain.yaml")?;
//!     let engine = Arc::new(
//!         Bombardier::builder()
//!             .args(RunArgs {
//!                 workers: 4,
//!                 ..Default::default()
//!             })
//!             .campaign(Arc::new(campaign))
//!             .transport(Arc::new(HttpTransport::default()))
//!             .build(),
//!     );
//!
//!     engine.fire_campaign();
//!     let summary = engine.bombard().await?;
//!     StdoutSink.emit(&summary).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `http`: the `reqwest` backed [`HttpTransport`]. (Enabled by default)

/// Outcome collectors
pub mod aggregate;
/// YAML campaign books
pub mod campaign;
/// Run parameters
pub mod config;
/// The bombardment engine
pub mod engine;
pub mod error;
/// Single observations
pub mod metric;
/// Dotted/bracketed paths into JSON values
pub mod path;
/// Worker pool with drain detection
pub mod pool;
/// Summaries and where they go
pub mod report;
/// JavaScript response handlers
pub mod script;
/// Shared substitution values
pub mod supply;
/// Request templates and placeholder substitution
pub mod template;
/// How requests reach the target
pub mod transport;

pub use aggregate::Aggregate;
pub use campaign::Campaign;
pub use config::RunArgs;
pub use engine::Bombardier;
pub use error::{AmmoError, CampaignError, ConfigError, PathError};
pub use metric::Metric;
pub use pool::WorkerPool;
pub use report::{Reporter, StdoutSink, Summary};
pub use supply::{Supply, SupplyContext};
pub use template::{Ammo, RequestTemplate};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{Exchange, Transport};
