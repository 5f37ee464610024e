use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::catalog::{ProductCandidate, ProductId, VariantId};
use parley_core::domain::session::WorkspaceId;

use super::codec::{format_timestamp, parse_u32};
use super::{CatalogRepository, RepositoryError};
use crate::DbPool;

/// Read side of the catalog: only what matching and cart pricing need.
pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CatalogRepository for SqlCatalogRepository {
    async fn snapshot(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ProductCandidate>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                product_id,
                variant_id,
                name,
                price,
                secondary_unit_label,
                secondary_unit_size,
                stock
             FROM catalog_product
             WHERE workspace_id = ? AND active = 1
             ORDER BY name ASC, product_id ASC, variant_id ASC",
        )
        .bind(&workspace_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(candidate_from_row).collect()
    }

    async fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        product: &ProductCandidate,
    ) -> Result<(), RepositoryError> {
        let (unit_label, unit_size) = match &product.secondary_unit {
            Some(unit) => (Some(unit.label.as_str()), Some(i64::from(unit.size))),
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO catalog_product (
                workspace_id,
                product_id,
                variant_id,
                name,
                price,
                secondary_unit_label,
                secondary_unit_size,
                stock,
                active,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
             ON CONFLICT(workspace_id, product_id, variant_id) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                secondary_unit_label = excluded.secondary_unit_label,
                secondary_unit_size = excluded.secondary_unit_size,
                stock = excluded.stock,
                active = 1,
                updated_at = excluded.updated_at",
        )
        .bind(&workspace_id.0)
        .bind(&product.product_id.0)
        .bind(product.variant_id.as_ref().map(|variant| variant.0.as_str()).unwrap_or(""))
        .bind(&product.name)
        .bind(product.price.to_string())
        .bind(unit_label)
        .bind(unit_size)
        .bind(product.stock)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn candidate_from_row(row: SqliteRow) -> Result<ProductCandidate, RepositoryError> {
    let price_raw: String = row.try_get("price")?;
    let price = Decimal::from_str(&price_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid price `{price_raw}`: {error}")))?;
    let variant: String = row.try_get("variant_id")?;
    let name: String = row.try_get("name")?;

    let mut candidate = ProductCandidate::new(
        ProductId(row.try_get("product_id")?),
        (!variant.is_empty()).then_some(VariantId(variant)),
        &name,
        price,
    );

    let unit_label: Option<String> = row.try_get("secondary_unit_label")?;
    let unit_size: Option<i64> = row.try_get("secondary_unit_size")?;
    if let (Some(label), Some(size)) = (unit_label, unit_size) {
        candidate = candidate.with_secondary_unit(label, parse_u32("secondary_unit_size", size)?);
    }
    if let Some(stock) = row.try_get::<Option<i64>, _>("stock")? {
        candidate = candidate.with_stock(stock);
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use parley_core::domain::catalog::{ProductCandidate, ProductId, VariantId};
    use parley_core::domain::session::WorkspaceId;

    use super::SqlCatalogRepository;
    use crate::migrations;
    use crate::repositories::CatalogRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn snapshot_returns_workspace_products_with_units_and_stock() {
        let pool = setup_pool().await;
        let repo = SqlCatalogRepository::new(pool.clone());
        let workspace = WorkspaceId("ws-1".to_string());

        let soda = ProductCandidate::new(
            ProductId("soda".to_string()),
            Some(VariantId("350ml".to_string())),
            "Soda 350ml",
            Decimal::new(450, 2),
        )
        .with_secondary_unit("box", 12)
        .with_stock(40);
        let water = ProductCandidate::new(
            ProductId("water".to_string()),
            None,
            "Mineral Water",
            Decimal::new(300, 2),
        );
        let foreign = ProductCandidate::new(
            ProductId("beer".to_string()),
            None,
            "Beer",
            Decimal::new(800, 2),
        );

        repo.upsert(&workspace, &soda).await.expect("upsert soda");
        repo.upsert(&workspace, &water).await.expect("upsert water");
        repo.upsert(&WorkspaceId("ws-2".to_string()), &foreign).await.expect("upsert foreign");

        let snapshot = repo.snapshot(&workspace).await.expect("snapshot");
        assert_eq!(snapshot, vec![water, soda]);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }
}
