//! Merchants and their per-source credentials, loaded from YAML.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use dayledger_adapters::{MetaCredentials, ShiprocketCredentials, ShopifyCredentials};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MerchantCredentials {
    #[serde(default)]
    pub shopify: Option<ShopifyCredentials>,
    #[serde(default)]
    pub meta: Option<MetaCredentials>,
    #[serde(default)]
    pub shiprocket: Option<ShiprocketCredentials>,
}

impl MerchantCredentials {
    pub fn configured_sources(&self) -> usize {
        [self.shopify.is_some(), self.meta.is_some(), self.shiprocket.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Merchant {
    pub user_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub credentials: MerchantCredentials,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MerchantRegistry {
    #[serde(default)]
    pub merchants: Vec<Merchant>,
}

impl MerchantRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing merchant registry")?;
        let mut ids = HashSet::new();
        for merchant in &registry.merchants {
            if merchant.user_id.trim().is_empty() {
                bail!("merchant registry has an entry with an empty user_id");
            }
            if !ids.insert(merchant.user_id.as_str()) {
                bail!("merchant {} is listed more than once", merchant.user_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, user_id: &str) -> Option<&Merchant> {
        self.merchants.iter().find(|m| m.user_id == user_id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Merchant> {
        self.merchants.iter().filter(|m| m.active)
    }
}
