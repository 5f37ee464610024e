use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::text::{normalize, tokenize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantId(pub String);

/// Alternate selling unit, e.g. a box of 12 cans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryUnit {
    pub label: String,
    pub size: u32,
}

/// Catalog row as seen by the matcher; built once per turn from the snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductCandidate {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub name: String,
    pub normalized_name: String,
    pub tokens: Vec<String>,
    pub price: Decimal,
    pub secondary_unit: Option<SecondaryUnit>,
    pub stock: Option<i64>,
}

impl ProductCandidate {
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        name: &str,
        price: Decimal,
    ) -> Self {
        let normalized_name = normalize(name);
        let tokens = tokenize(&normalized_name);
        Self {
            product_id,
            variant_id,
            name: name.trim().to_owned(),
            normalized_name,
            tokens,
            price,
            secondary_unit: None,
            stock: None,
        }
    }

    pub fn with_secondary_unit(mut self, label: impl Into<String>, size: u32) -> Self {
        self.secondary_unit = Some(SecondaryUnit { label: label.into(), size: size.max(1) });
        self
    }

    pub fn with_stock(mut self, stock: i64) -> Self {
        self.stock = Some(stock);
        self
    }

    /// Units requested once a secondary unit (box, pack) is expanded.
    pub fn base_quantity(&self, quantity: u32, uses_secondary_unit: bool) -> u32 {
        match (&self.secondary_unit, uses_secondary_unit) {
            (Some(unit), true) => quantity.saturating_mul(unit.size),
            _ => quantity,
        }
    }

    pub fn same_line(&self, other: &ProductCandidate) -> bool {
        self.product_id == other.product_id && self.variant_id == other.variant_id
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ProductCandidate, ProductId, VariantId};

    #[test]
    fn candidate_precomputes_normalized_tokens() {
        let candidate = ProductCandidate::new(
            ProductId("p-1".to_owned()),
            None,
            "  Água  Mineral Crystal ",
            Decimal::new(250, 2),
        );

        assert_eq!(candidate.name, "Água  Mineral Crystal");
        assert_eq!(candidate.normalized_name, "agua mineral crystal");
        assert_eq!(candidate.tokens, vec!["agua", "mineral", "crystal"]);
    }

    #[test]
    fn secondary_unit_expands_quantity_only_when_requested() {
        let candidate = ProductCandidate::new(
            ProductId("p-2".to_owned()),
            Some(VariantId("350ml".to_owned())),
            "Soda",
            Decimal::ONE,
        )
        .with_secondary_unit("box", 12);

        assert_eq!(candidate.base_quantity(2, true), 24);
        assert_eq!(candidate.base_quantity(2, false), 2);
    }
}
