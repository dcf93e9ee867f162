// Context-scoped request coordination for API clients.
// Caching, request coalescing, rate-limit pauses, auth refresh and invalidation.

//! A client-side layer between application code and an HTTP API.
//!
//! Reads are cached per endpoint, query and [`RequestContext`], so data for one
//! institute or class never answers a request for another. Concurrent identical
//! reads share one network call, a 429 pauses all traffic until the server's
//! retry hint elapses, and simultaneous 401s trigger a single credential refresh.
//! Mutations evict the cached reads they affect through [`InvalidationRule`]s.
//!
//! ```no_run
//! use scoped_fetch::{CoordinatorConfig, QueryParams, ReadOptions, RequestContext, RequestCoordinator};
//!
//! # async fn run() -> scoped_fetch::Result<()> {
//! let coordinator = RequestCoordinator::builder(
//!     CoordinatorConfig::default().with_base_url("https://api.example.com"),
//! )
//! .build()?;
//!
//! let context = RequestContext::new().user("u1").institute("i1");
//! let subjects = coordinator
//!     .read("/subjects", &QueryParams::new(), &context, ReadOptions::new())
//!     .await?;
//! # let _ = subjects;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flight;
pub mod guard;
pub mod http;
pub mod invalidation;
pub mod stats;

#[cfg(test)]
mod testing;

pub use auth::{CredentialStore, Credentials, InMemoryCredentials};
pub use cache::{
    CacheEntry, CacheStore, ContextField, DiskStore, MemoryStore, QueryParams, RequestContext,
    RequestKey,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorBuilder, CoordinatorState, ReadOptions, RequestCoordinator};
pub use error::{FetchError, Result};
pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use invalidation::{EndpointPattern, InvalidationEngine, InvalidationRule, InvalidationTarget};
pub use reqwest::Method;
pub use stats::StatsSnapshot;
