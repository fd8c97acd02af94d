//! Sync orchestration: retry/backoff, date grouping, cost resolution, the
//! per-user pipeline, scheduling and Parquet export.

use std::sync::Arc;

use anyhow::Result;
use dayledger_adapters::{MetaAdSource, ShiprocketShipmentSource, ShopifyOrderSource};
use dayledger_storage::HttpFetcher;

pub mod config;
pub mod costs;
pub mod export;
pub mod grouping;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use config::SyncConfig;
pub use costs::CostResolver;
pub use export::{export_daily_metrics, ExportManifest};
pub use grouping::{group_by_day, Grouped, ParseWarning, SourceBatch};
pub use pipeline::{SyncOutcome, SyncPipeline, SyncSources, SyncStores};
pub use registry::{Merchant, MerchantCredentials, MerchantRegistry};
pub use retry::{BackoffPolicy, RetryExecutor, Sleeper, TokioSleeper};
pub use scheduler::{build_scheduler, CycleReport, SyncService, TriggerError};

pub const CRATE_NAME: &str = "dayledger-sync";

/// The live adapters, sharing one HTTP client and its concurrency limits.
pub fn production_sources(config: &SyncConfig) -> Result<SyncSources> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let mut ads = MetaAdSource::new(http.clone(), config.meta_graph_url.clone());
    if !config.meta_campaign_breakdown {
        ads = ads.without_campaign_breakdown();
    }
    Ok(SyncSources {
        orders: Arc::new(ShopifyOrderSource::new(http.clone(), config.shopify_api_version.clone())),
        ads: Arc::new(ads),
        shipments: Arc::new(ShiprocketShipmentSource::new(http, config.shiprocket_url.clone())),
    })
}

/// Pipeline over live adapters and the given stores, retrying per `config`.
pub fn production_pipeline(config: &SyncConfig, stores: SyncStores) -> Result<SyncPipeline> {
    let executor = RetryExecutor::new(config.backoff_policy(), Arc::new(TokioSleeper));
    Ok(SyncPipeline::new(production_sources(config)?, stores, executor))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use dayledger_adapters::{
        AdapterError, MetaCredentials, ShiprocketCredentials, ShopifyCredentials, SourceAdapter,
    };
    use dayledger_core::{
        LineItem, RawAdInsight, RawOrderRecord, RawShipment, ShipmentCharges, ShipmentStatus, SourceKind,
        SyncWindow,
    };
    use dayledger_storage::{FetchError, MemoryStore};

    use crate::pipeline::{SyncPipeline, SyncSources, SyncStores};
    use crate::registry::{Merchant, MerchantCredentials};
    use crate::retry::tests::RecordingSleeper;
    use crate::retry::{BackoffPolicy, RetryExecutor};

    pub struct StubSource<C, R> {
        kind: SourceKind,
        records: Mutex<Vec<R>>,
        failing: AtomicBool,
        calls: AtomicU32,
        _credentials: PhantomData<fn(&C)>,
    }

    impl<C, R: Clone> StubSource<C, R> {
        fn new(kind: SourceKind, records: Vec<R>) -> Self {
            Self {
                kind,
                records: Mutex::new(records),
                failing: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                _credentials: PhantomData,
            }
        }

        pub fn records(&self) -> Vec<R> {
            self.records.lock().unwrap().clone()
        }

        pub fn set_records(&self, records: Vec<R>) {
            *self.records.lock().unwrap() = records;
        }

        pub fn fail_always(&self) {
            self.failing.store(true, Ordering::SeqCst);
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<C, R> SourceAdapter for StubSource<C, R>
    where
        C: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        type Credentials = C;
        type Record = R;

        fn source(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(&self, _credentials: &C, _window: SyncWindow) -> Result<Vec<R>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(AdapterError::Fetch(FetchError::HttpStatus {
                    status: 503,
                    url: format!("stub://{}", self.kind),
                }));
            }
            Ok(self.records())
        }
    }

    pub struct Harness {
        pub pipeline: SyncPipeline,
        pub store: Arc<MemoryStore>,
        pub orders: Arc<StubSource<ShopifyCredentials, RawOrderRecord>>,
        pub ads: Arc<StubSource<MetaCredentials, RawAdInsight>>,
        pub shipments: Arc<StubSource<ShiprocketCredentials, RawShipment>>,
    }

    fn kurta_order(id: &str, created_at: &str, customer: &str) -> RawOrderRecord {
        RawOrderRecord {
            external_id: id.into(),
            created_at: created_at.into(),
            total: 1999.0,
            line_items: vec![LineItem {
                product_id: "p-kurta".into(),
                name: Some("Cotton Kurta".into()),
                quantity: 1,
                unit_price: 1999.0,
            }],
            customer_id: Some(customer.into()),
        }
    }

    pub fn shipment_record(id: &str, created_at: &str, status: ShipmentStatus, freight: f64) -> RawShipment {
        RawShipment {
            external_id: id.into(),
            status,
            created_at: created_at.into(),
            charges: ShipmentCharges {
                freight,
                ..Default::default()
            },
        }
    }

    fn account_insight(date: &str, spend: f64) -> RawAdInsight {
        RawAdInsight {
            date: date.into(),
            spend,
            reach: 9000,
            impressions: 20000,
            clicks: 300,
            campaign_id: None,
            campaign_name: None,
        }
    }

    /// 2024-10-26: three ₹1,999 orders, ₹450 ad spend, one ₹80 shipment.
    /// 2024-10-27: ad-only day with ₹200 spend.
    pub fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let orders = Arc::new(StubSource::new(
            SourceKind::Orders,
            vec![
                kurta_order("o3", "2024-10-26T21:15:00+05:30", "c1"),
                kurta_order("o2", "2024-10-26T14:02:00+05:30", "c2"),
                kurta_order("o1", "2024-10-26T09:30:00+05:30", "c1"),
            ],
        ));
        let ads = Arc::new(StubSource::new(
            SourceKind::Ads,
            vec![account_insight("2024-10-26", 450.0), account_insight("2024-10-27", 200.0)],
        ));
        let shipments = Arc::new(StubSource::new(
            SourceKind::Shipments,
            vec![shipment_record("s1", "26th Oct 2024 08:11 AM", ShipmentStatus::Delivered, 80.0)],
        ));

        let sources = SyncSources {
            orders: orders.clone(),
            ads: ads.clone(),
            shipments: shipments.clone(),
        };
        let stores = SyncStores {
            metrics: store.clone(),
            costs: store.clone(),
            jobs: store.clone(),
        };
        let executor = RetryExecutor::new(BackoffPolicy::default(), Arc::new(RecordingSleeper::default()));

        Harness {
            pipeline: SyncPipeline::new(sources, stores, executor),
            store,
            orders,
            ads,
            shipments,
        }
    }

    pub fn merchant(user_id: &str) -> Merchant {
        Merchant {
            user_id: user_id.into(),
            active: true,
            credentials: MerchantCredentials {
                shopify: Some(ShopifyCredentials {
                    store: "acme".into(),
                    access_token: "shpat_test".into(),
                }),
                meta: Some(MetaCredentials {
                    access_token: "EAAB".into(),
                    ad_account_id: "act_1".into(),
                }),
                shiprocket: Some(ShiprocketCredentials {
                    email: "ops@acme.test".into(),
                    password: "secret".into(),
                }),
            },
        }
    }
}
