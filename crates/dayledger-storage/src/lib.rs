//! HTTP transport and persistence for dayledger.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, next_link, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{fingerprint, MetricsStore, ProductCostStore, StoreError, SyncJobStore, UpsertOutcome};

pub const CRATE_NAME: &str = "dayledger-storage";
