use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use parley_core::domain::cart::{Cart, CartItem};
use parley_core::domain::catalog::{ProductCandidate, ProductId, VariantId};
use parley_core::domain::session::ConversationMode;
use parley_core::flows::ConversationState;

use super::{Tool, ToolContext, ToolError, ToolOutcome, ToolRegistry, INSUFFICIENT_STOCK};
use crate::llm::ToolDefinition;

const ORDERING: &[ConversationMode] = &[ConversationMode::Ordering];
const ALL_MODES: &[ConversationMode] =
    &[ConversationMode::Ordering, ConversationMode::Informational, ConversationMode::Payment];

pub fn register_cart_tools(registry: &mut ToolRegistry) {
    registry.register(AddToCart);
    registry.register(SetCartQuantity);
    registry.register(ClearCart);
    registry.register(ViewCart);
    registry.register(ReviewCart);
}

#[derive(Debug, Deserialize)]
struct LineInput {
    product_id: String,
    #[serde(default)]
    variant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddInput {
    #[serde(flatten)]
    line: LineInput,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct SetQuantityInput {
    #[serde(flatten)]
    line: LineInput,
    quantity: i64,
}

fn parse_input<T: for<'de> Deserialize<'de>>(tool: &str, input: Value) -> Result<T, ToolError> {
    serde_json::from_value(input).map_err(|error| ToolError::InvalidInput {
        tool: tool.to_string(),
        message: error.to_string(),
    })
}

fn line_schema(quantity_description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "product_id": { "type": "string", "description": "Catalog product id" },
            "variant_id": {
                "type": "string",
                "description": "Variant id when the product has several"
            },
            "quantity": { "type": "integer", "description": quantity_description }
        },
        "required": ["product_id", "quantity"]
    })
}

/// Picks the catalog line for `(product_id, variant_id)`. Without a variant the
/// product must be unambiguous.
fn find_product<'a>(
    catalog: &'a [ProductCandidate],
    line: &LineInput,
) -> Result<&'a ProductCandidate, String> {
    let matches: Vec<&ProductCandidate> =
        catalog.iter().filter(|candidate| candidate.product_id.0 == line.product_id).collect();
    if matches.is_empty() {
        return Err(format!("Product `{}` is not in the catalog.", line.product_id));
    }

    match line.variant_id.as_deref() {
        Some(variant) => matches
            .into_iter()
            .find(|candidate| candidate.variant_id.as_ref().is_some_and(|id| id.0 == variant))
            .ok_or_else(|| format!("`{}` has no variant `{variant}`.", line.product_id)),
        None if matches.len() == 1 => Ok(matches[0]),
        None => {
            let names: Vec<&str> =
                matches.iter().map(|candidate| candidate.name.as_str()).collect();
            Err(format!("Which one: {}?", names.join(", ")))
        }
    }
}

/// Failure shaped for the shortage prompt: how many more units fit in stock.
fn shortage(product: &ProductCandidate, requested: u32, in_cart: u32) -> Option<ToolOutcome> {
    let stock = product.stock?;
    let stock = u32::try_from(stock.max(0)).unwrap_or(u32::MAX);
    if in_cart.saturating_add(requested) <= stock {
        return None;
    }
    let available = stock.saturating_sub(in_cart);
    Some(ToolOutcome::failure_with_data(
        format!("Sorry, only {available} of {} available.", product.name),
        json!({
            "code": INSUFFICIENT_STOCK,
            "product_id": product.product_id.0,
            "variant_id": product.variant_id.as_ref().map(|variant| variant.0.clone()),
            "name": product.name,
            "requested": requested,
            "available": available,
        }),
    ))
}

pub fn cart_json(cart: &Cart) -> Value {
    let items: Vec<Value> = cart
        .items
        .iter()
        .map(|item| {
            json!({
                "product_id": item.product_id.0,
                "variant_id": item.variant_id.as_ref().map(|variant| variant.0.clone()),
                "name": item.name,
                "quantity": item.quantity,
                "unit_price": item.unit_price.round_dp(2).to_string(),
                "total": item.total.round_dp(2).to_string(),
            })
        })
        .collect();
    json!({
        "items": items,
        "subtotal": cart.subtotal.round_dp(2).to_string(),
        "total": cart.total.round_dp(2).to_string(),
        "summary": cart.summary(),
    })
}

pub struct AddToCart;

#[async_trait]
impl Tool for AddToCart {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "add_to_cart".to_string(),
            description: "Add a catalog product to the customer's cart. \
                          Prices come from the catalog."
                .to_string(),
            input_schema: line_schema("Units to add, at least 1"),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        ORDERING
    }

    async fn execute(
        &self,
        input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let input: AddInput = parse_input("add_to_cart", input)?;
        if input.quantity == 0 {
            return Ok(ToolOutcome::failure("Quantity must be at least 1."));
        }
        let product = match find_product(context.catalog, &input.line) {
            Ok(product) => product,
            Err(message) => return Ok(ToolOutcome::failure(message)),
        };

        let in_cart =
            context.memory.cart().quantity_of(&product.product_id, product.variant_id.as_ref());
        if let Some(failure) = shortage(product, input.quantity, in_cart) {
            return Ok(failure);
        }

        let cart = context.memory.cart_mut();
        cart.add_item(CartItem::new(
            product.product_id.clone(),
            product.variant_id.clone(),
            product.name.clone(),
            input.quantity,
            product.price,
        ));
        Ok(ToolOutcome::ok(cart_json(cart)).with_transition(ConversationState::CollectingOrder))
    }
}

pub struct SetCartQuantity;

#[async_trait]
impl Tool for SetCartQuantity {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "set_cart_quantity".to_string(),
            description: "Set the quantity of a cart line; 0 removes it.".to_string(),
            input_schema: line_schema("New quantity; 0 or less removes the line"),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        ORDERING
    }

    async fn execute(
        &self,
        input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let input: SetQuantityInput = parse_input("set_cart_quantity", input)?;
        let product_id = ProductId(input.line.product_id.clone());
        let variant_id = input.line.variant_id.clone().map(VariantId);

        if input.quantity > 0 {
            if let Ok(product) = find_product(context.catalog, &input.line) {
                let requested = u32::try_from(input.quantity).unwrap_or(u32::MAX);
                if let Some(failure) = shortage(product, requested, 0) {
                    return Ok(failure);
                }
            }
        }

        let cart = context.memory.cart_mut();
        if !cart.set_quantity(&product_id, variant_id.as_ref(), input.quantity) {
            return Ok(ToolOutcome::failure(format!(
                "`{}` is not in the cart.",
                input.line.product_id
            )));
        }
        let outcome = ToolOutcome::ok(cart_json(cart));
        if cart.is_empty() {
            return Ok(outcome);
        }
        Ok(outcome.with_transition(ConversationState::CollectingOrder))
    }
}

pub struct ClearCart;

#[async_trait]
impl Tool for ClearCart {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "clear_cart".to_string(),
            description: "Remove every item from the cart.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        ORDERING
    }

    async fn execute(
        &self,
        _input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let cart = context.memory.cart_mut();
        cart.clear();
        Ok(ToolOutcome::ok(cart_json(cart)).with_transition(ConversationState::Idle))
    }
}

pub struct ViewCart;

#[async_trait]
impl Tool for ViewCart {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "view_cart".to_string(),
            description: "Show the current cart with totals.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        ALL_MODES
    }

    async fn execute(
        &self,
        _input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        Ok(ToolOutcome::ok(cart_json(&context.memory.cart())))
    }
}

/// Moves a non-empty cart to the confirm/cancel review.
pub struct ReviewCart;

#[async_trait]
impl Tool for ReviewCart {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "review_cart".to_string(),
            description: "Ask the customer to confirm the cart once they are done adding items."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        ORDERING
    }

    async fn execute(
        &self,
        _input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        if !context.memory.has_items() {
            return Ok(ToolOutcome::failure("The cart is empty."));
        }
        Ok(ToolOutcome::ok(cart_json(&context.memory.cart()))
            .with_transition(ConversationState::AwaitingConfirmation))
    }
}
