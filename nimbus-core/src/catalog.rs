//! Product catalog
//!
//! Products are loaded from a TOML file:
//!
//! ```toml
//! [[products]]
//! name = "standard-2c4g"
//! cpu = 2
//! memory_gb = 4
//! disk_gb = 40
//! os_options = ["ubuntu-22.04", "debian-12"]
//! status = "published"
//!
//! [[products.prices]]
//! billing_cycle = "month"
//! unit_price = "30.00"
//! ```
//!
//! Importing upserts by product name, so a catalog file can be re-applied.

use std::path::Path;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NimbusError, NimbusResult};
use crate::storage::Store;
use crate::types::{Product, ProductPrice, ProductStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogFile {
    pub products: Vec<ProductDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductDefinition {
    pub name: String,
    pub description: String,
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub bandwidth_mbps: u32,
    pub os_options: Vec<String>,
    pub customizable: bool,
    pub min_cpu: u32,
    pub max_cpu: u32,
    pub min_memory_gb: u32,
    pub max_memory_gb: u32,
    pub min_disk_gb: u32,
    pub max_disk_gb: u32,
    pub status: ProductStatus,
    pub prices: Vec<ProductPrice>,
}

impl Default for ProductDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            cpu: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 100,
            os_options: Vec::new(),
            customizable: false,
            min_cpu: 0,
            max_cpu: 0,
            min_memory_gb: 0,
            max_memory_gb: 0,
            min_disk_gb: 0,
            max_disk_gb: 0,
            status: ProductStatus::Draft,
            prices: Vec::new(),
        }
    }
}

impl ProductDefinition {
    fn validate(&self) -> NimbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(NimbusError::validation("name", "product name must not be empty"));
        }
        if self.cpu == 0 || self.memory_gb == 0 || self.disk_gb == 0 {
            return Err(NimbusError::validation(
                "spec",
                format!("product {} needs non-zero cpu, memory and disk", self.name),
            ));
        }
        for price in &self.prices {
            if price.billing_cycle.trim().is_empty() {
                return Err(NimbusError::validation("billing_cycle", "billing cycle must not be empty"));
            }
            if price.unit_price <= Decimal::ZERO {
                return Err(NimbusError::validation(
                    "unit_price",
                    format!("price of {} for {} must be positive", self.name, price.billing_cycle),
                ));
            }
        }
        Ok(())
    }

    fn apply_to(&self, product: &mut Product) {
        product.name = self.name.clone();
        product.description = self.description.clone();
        product.cpu = self.cpu;
        product.memory_gb = self.memory_gb;
        product.disk_gb = self.disk_gb;
        product.bandwidth_mbps = self.bandwidth_mbps;
        product.os_options = self.os_options.clone();
        product.customizable = self.customizable;
        product.min_cpu = self.min_cpu;
        product.max_cpu = self.max_cpu;
        product.min_memory_gb = self.min_memory_gb;
        product.max_memory_gb = self.max_memory_gb;
        product.min_disk_gb = self.min_disk_gb;
        product.max_disk_gb = self.max_disk_gb;
        product.status = self.status;
        product.prices = self.prices.clone();
    }
}

impl CatalogFile {
    pub fn from_file(path: impl AsRef<Path>) -> NimbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NimbusError::configuration("catalog", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> NimbusResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    store: Store,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or update every definition, matching existing products by name.
    /// Either all definitions are written or none.
    pub async fn import(&self, file: &CatalogFile) -> NimbusResult<Vec<Product>> {
        for definition in &file.products {
            definition.validate()?;
        }

        let now = Utc::now();
        let products = self
            .store
            .write("import catalog", |txn| {
                let existing: Vec<Product> = txn.scan(|_: &Product| true)?;
                let mut written = Vec::with_capacity(file.products.len());

                for definition in &file.products {
                    match existing.iter().find(|p| p.name == definition.name) {
                        Some(current) => {
                            let mut product = current.clone();
                            definition.apply_to(&mut product);
                            product.updated_at = now;
                            txn.put(&product)?;
                            written.push(product);
                        }
                        None => {
                            let mut product = Product {
                                id: 0,
                                name: String::new(),
                                description: String::new(),
                                cpu: 0,
                                memory_gb: 0,
                                disk_gb: 0,
                                bandwidth_mbps: 0,
                                os_options: Vec::new(),
                                customizable: false,
                                min_cpu: 0,
                                max_cpu: 0,
                                min_memory_gb: 0,
                                max_memory_gb: 0,
                                min_disk_gb: 0,
                                max_disk_gb: 0,
                                status: ProductStatus::Draft,
                                prices: Vec::new(),
                                created_at: now,
                                updated_at: now,
                            };
                            definition.apply_to(&mut product);
                            txn.insert_new(&mut product)?;
                            written.push(product);
                        }
                    }
                }
                Ok(written)
            })
            .await?;

        info!("Imported {} catalog products", products.len());
        Ok(products)
    }

    pub async fn products(&self) -> NimbusResult<Vec<Product>> {
        let mut products = self
            .store
            .read("list products", |txn| txn.scan(|_: &Product| true))
            .await?;
        products.sort_by_key(|p| p.id);
        Ok(products)
    }

    /// Products that can currently be ordered.
    pub async fn published(&self) -> NimbusResult<Vec<Product>> {
        Ok(self
            .products()
            .await?
            .into_iter()
            .filter(|p| p.status == ProductStatus::Published)
            .collect())
    }

    pub async fn set_status(&self, product_id: u64, status: ProductStatus) -> NimbusResult<Product> {
        self.store
            .write("set product status", |txn| {
                let mut product = txn.require::<Product>(product_id)?;
                product.status = status;
                product.updated_at = Utc::now();
                txn.put(&product)?;
                Ok(product)
            })
            .await
    }
}
