use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::catalog::{ProductId, VariantId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total: Decimal,
}

impl CartItem {
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Decimal,
    ) -> Self {
        Self {
            product_id,
            variant_id,
            name: name.into(),
            quantity,
            unit_price,
            total: unit_price * Decimal::from(quantity),
        }
    }

    pub fn is_same_line(&self, product_id: &ProductId, variant_id: Option<&VariantId>) -> bool {
        &self.product_id == product_id && self.variant_id.as_ref() == variant_id
    }

    fn reprice(&mut self) {
        self.total = self.unit_price * Decimal::from(self.quantity);
    }
}

/// Order under construction. Totals are derived; every mutation recomputes them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Adds a line, merging quantities into an existing `(product, variant)` line.
    pub fn add_item(&mut self, item: CartItem) {
        if item.quantity == 0 {
            return;
        }
        match self
            .items
            .iter_mut()
            .find(|line| line.is_same_line(&item.product_id, item.variant_id.as_ref()))
        {
            Some(line) => {
                line.quantity = line.quantity.saturating_add(item.quantity);
                line.unit_price = item.unit_price;
                line.reprice();
            }
            None => {
                let mut item = item;
                item.reprice();
                self.items.push(item);
            }
        }
        self.recompute();
    }

    /// Sets the quantity of an existing line; zero or negative removes it.
    /// Returns false when no such line exists.
    pub fn set_quantity(
        &mut self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
        quantity: i64,
    ) -> bool {
        let Some(position) =
            self.items.iter().position(|line| line.is_same_line(product_id, variant_id))
        else {
            return false;
        };

        if quantity <= 0 {
            self.items.remove(position);
        } else {
            let line = &mut self.items[position];
            line.quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
            line.reprice();
        }
        self.recompute();
        true
    }

    pub fn quantity_of(&self, product_id: &ProductId, variant_id: Option<&VariantId>) -> u32 {
        self.items
            .iter()
            .find(|line| line.is_same_line(product_id, variant_id))
            .map(|line| line.quantity)
            .unwrap_or(0)
    }

    pub fn set_adjustments(&mut self, shipping: Decimal, discount: Decimal) {
        self.shipping = shipping.max(Decimal::ZERO);
        self.discount = discount.max(Decimal::ZERO);
        self.recompute();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn recompute(&mut self) {
        self.subtotal = self.items.iter().map(|item| item.total).sum();
        self.total = (self.subtotal + self.shipping - self.discount).max(Decimal::ZERO);
    }

    /// Plain-text summary used in replies and in the reasoning system prompt.
    pub fn summary(&self) -> String {
        if self.items.is_empty() {
            return "Cart is empty.".to_owned();
        }
        let mut lines: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{}x {} @ {} = {}",
                    item.quantity,
                    item.name,
                    item.unit_price.round_dp(2),
                    item.total.round_dp(2)
                )
            })
            .collect();
        if !self.shipping.is_zero() {
            lines.push(format!("Shipping: {}", self.shipping.round_dp(2)));
        }
        if !self.discount.is_zero() {
            lines.push(format!("Discount: -{}", self.discount.round_dp(2)));
        }
        lines.push(format!("Total: {}", self.total.round_dp(2)));
        lines.join("\n")
    }
}
