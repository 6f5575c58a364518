//! # Routine Sync Cache
//!
//! Request-interception cache engine for the app shell.
//!
//! Each request is classified into a [`Strategy`] and answered from the
//! network, the current cache generation, or both:
//!
//! ```text
//! request ─► Classifier ─► PassThrough          ─► network
//!                        ├ NetworkFirst         ─► network ▸ cache ▸ offline page
//!                        ├ CacheFirst           ─► cache (+refresh) ▸ network ▸ 408
//!                        ├ StaleWhileRevalidate ─► cache (+refresh) ▸ network ▸ 408
//!                        └ NetworkWithTimeout   ─► network(≤ window) ▸ cache ▸ 408
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod classify;
pub mod control;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod policy;
pub mod request;
pub mod storage;

pub use classify::{Classifier, Strategy};
pub use control::{ControlMessage, ControlReply};
pub use engine::{CacheEngine, CacheStats, Handled, Phase, PrecacheReport, ResponseSource};
pub use error::{CacheResult, CacheStorageError, ClassificationError, FetchError, FetchResult};
pub use fetch::{Fetcher, HttpFetcher};
pub use policy::CachePolicy;
pub use request::{cache_key, CacheRequest, CacheResponse, Destination, OFFLINE_HEADER, STRATEGY_HEADER};
pub use storage::{CacheStorage, MemoryCacheStorage};
