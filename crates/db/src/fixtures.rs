use rust_decimal::Decimal;

use parley_core::domain::catalog::{ProductCandidate, ProductId, VariantId};
use parley_core::domain::session::WorkspaceId;

use crate::repositories::{CatalogRepository, RepositoryError};

struct DemoProduct {
    product_id: &'static str,
    variant_id: Option<&'static str>,
    name: &'static str,
    price_cents: i64,
    secondary_unit: Option<(&'static str, u32)>,
    stock: Option<i64>,
}

/// Small beverage/snack catalog used by local demos and end-to-end tests.
const DEMO_PRODUCTS: &[DemoProduct] = &[
    DemoProduct {
        product_id: "soda",
        variant_id: Some("350ml"),
        name: "Soda Can 350ml",
        price_cents: 450,
        secondary_unit: Some(("box", 12)),
        stock: Some(120),
    },
    DemoProduct {
        product_id: "water",
        variant_id: None,
        name: "Mineral Water",
        price_cents: 300,
        secondary_unit: Some(("pack", 6)),
        stock: Some(60),
    },
    DemoProduct {
        product_id: "juice",
        variant_id: Some("orange"),
        name: "Orange Juice",
        price_cents: 700,
        secondary_unit: None,
        stock: Some(3),
    },
    DemoProduct {
        product_id: "juice",
        variant_id: Some("grape"),
        name: "Grape Juice",
        price_cents: 750,
        secondary_unit: None,
        stock: Some(10),
    },
    DemoProduct {
        product_id: "chips",
        variant_id: None,
        name: "Potato Chips",
        price_cents: 550,
        secondary_unit: None,
        stock: None,
    },
    DemoProduct {
        product_id: "pao-queijo",
        variant_id: None,
        name: "Pão de Queijo",
        price_cents: 200,
        secondary_unit: Some(("dozen", 12)),
        stock: None,
    },
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub workspace_id: WorkspaceId,
    pub products_loaded: usize,
}

pub struct DemoCatalog;

impl DemoCatalog {
    pub fn products() -> Vec<ProductCandidate> {
        DEMO_PRODUCTS
            .iter()
            .map(|product| {
                let mut candidate = ProductCandidate::new(
                    ProductId(product.product_id.to_string()),
                    product.variant_id.map(|variant| VariantId(variant.to_string())),
                    product.name,
                    Decimal::new(product.price_cents, 2),
                );
                if let Some((label, size)) = product.secondary_unit {
                    candidate = candidate.with_secondary_unit(label, size);
                }
                if let Some(stock) = product.stock {
                    candidate = candidate.with_stock(stock);
                }
                candidate
            })
            .collect()
    }

    /// Idempotent: re-running overwrites the same rows.
    pub async fn load(
        repository: &dyn CatalogRepository,
        workspace_id: &WorkspaceId,
    ) -> Result<SeedResult, RepositoryError> {
        let products = Self::products();
        for product in &products {
            repository.upsert(workspace_id, product).await?;
        }
        Ok(SeedResult { workspace_id: workspace_id.clone(), products_loaded: products.len() })
    }
}

#[cfg(test)]
mod tests {
    use parley_core::domain::session::WorkspaceId;

    use super::DemoCatalog;
    use crate::repositories::{CatalogRepository, InMemoryCatalogRepository};

    #[tokio::test]
    async fn demo_catalog_load_is_idempotent() {
        let repo = InMemoryCatalogRepository::default();
        let workspace = WorkspaceId("demo".to_string());

        let first = DemoCatalog::load(&repo, &workspace).await.expect("first load");
        let second = DemoCatalog::load(&repo, &workspace).await.expect("second load");
        assert_eq!(first, second);

        let snapshot = repo.snapshot(&workspace).await.expect("snapshot");
        assert_eq!(snapshot.len(), DemoCatalog::products().len());
        assert!(snapshot.iter().any(|product| product.normalized_name == "pao de queijo"));
    }
}
