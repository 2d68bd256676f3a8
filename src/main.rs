//! A storefront load test: authenticated users repeatedly add a product to
//! their cart and view the checkout page.
//!
//! Every virtual user derives a session from the bearer token exported in the
//! `STAMPEDE_TOKEN` environment variable (override the variable name with
//! `--token-env`), then alternates between the two tasks, pausing 1 to 5
//! seconds after each. Both tasks aggregate under normalized metric names so
//! per-instance path variations roll up under one key.
//!
//! ```bash
//! $ export STAMPEDE_TOKEN=...
//! $ stampede --host https://shop.example.com -u 10 -r 2 -t 10m
//! ```

use serde_json::json;
use stampede::prelude::*;
use std::env;

/// The cart-mutation endpoint, and the name its requests aggregate under.
const ADD_TO_CART_PATH: &str = "/api/v1/cart/add";
const ADD_TO_CART_NAME: &str = "/api/cart/add";

/// The checkout-view endpoint, and the name its requests aggregate under.
const VIEW_CHECKOUT_PATH: &str = "/api/v1/checkout";
const VIEW_CHECKOUT_NAME: &str = "/api/checkout";

fn main() -> Result<(), StampedeError> {
    // The product added to carts; override to exercise a real product.
    let product_id =
        env::var("STAMPEDE_PRODUCT_ID").unwrap_or_else(|_| "EXAMPLE_PRODUCT_123".to_string());
    let quantity: usize = env::var("STAMPEDE_QUANTITY")
        .ok()
        .and_then(|quantity| quantity.parse().ok())
        .unwrap_or(1);

    let metrics = Stampede::initialize()?
        .register_catalog(
            Catalog::new("StorefrontUser")
                // Pause 1 to 5 seconds after each task.
                .set_wait_time(1_000, 5_000)?
                .register_task(
                    TaskDescriptor::post(
                        ADD_TO_CART_PATH,
                        json!({"product_id": product_id, "quantity": quantity}),
                    )
                    .set_name(ADD_TO_CART_NAME),
                )
                .register_task(
                    TaskDescriptor::get(VIEW_CHECKOUT_PATH).set_name(VIEW_CHECKOUT_NAME),
                ),
        )
        .execute()?;
    metrics.print();

    Ok(())
}
