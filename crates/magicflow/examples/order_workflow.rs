//! Order processing workflow with branching, events and recovery.
//!
//! Demonstrates:
//! - Typed data stored in the context through serde
//! - Conditional branching on the order amount
//! - Watching lifecycle events on the broadcast bus
//! - Retrying a failed payment with a RecoveryManager
//!
//! Run with `RUST_LOG=magicflow=debug cargo run --example order_workflow`.

use async_trait::async_trait;
use magicflow::prelude::*;
use magicflow::RecoveryConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    customer_id: String,
    items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderItem {
    product_id: String,
    quantity: u32,
    price: f64,
}

impl Order {
    fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum()
    }
}

#[derive(Debug)]
struct ValidateOrder;

#[async_trait]
impl Step for ValidateOrder {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        let order: Order = ctx.get_as("order")?;
        if order.items.is_empty() {
            return Err(MagicFlowError::step_error(
                self.name(),
                "order must contain at least one item",
            ));
        }
        ctx.insert("total", order.total());
        println!("Validated order {} ({:.2})", order.id, order.total());
        Ok(None)
    }

    fn name(&self) -> StepName {
        StepName::new("validate_order")
    }
}

/// Declines the first charge to show recovery at work.
#[derive(Debug, Default)]
struct ChargePayment {
    declined_once: AtomicBool,
}

#[async_trait]
impl Step for ChargePayment {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        let total: f64 = ctx.get_as("total")?;
        if !self.declined_once.swap(true, Ordering::SeqCst) {
            return Err(MagicFlowError::step_error(
                self.name(),
                "payment gateway timed out",
            ));
        }
        let order: Order = ctx.get_as("order")?;
        ctx.set_step_result("charge_payment", format!("TX-{}", order.id));
        println!("Charged {total:.2} for order {}", order.id);
        Ok(None)
    }

    fn name(&self) -> StepName {
        StepName::new("charge_payment")
    }
}

fn order(id: &str, items: Vec<OrderItem>) -> Order {
    Order {
        id: id.to_string(),
        customer_id: "CUST-456".to_string(),
        items,
    }
}

fn item(product_id: &str, quantity: u32, price: f64) -> OrderItem {
    OrderItem {
        product_id: product_id.to_string(),
        quantity,
        price,
    }
}

fn order_request(order: &Order) -> Result<WorkflowRequest, MagicFlowError> {
    let request = WorkflowRequest::new(order.id.clone(), "order_processing")
        .tag(order.customer_id.clone())
        .step(ValidateOrder)
        .step(
            ConditionalStep::new("check_amount", |ctx| Ok(ctx.get_as::<f64>("total")? >= 100.0))
                .when_true("manual_review")
                .when_false("ship_order"),
        )
        .step(FunctionStep::new("manual_review", |ctx| {
            ctx.set_step_result("manual_review", "approved");
            println!("Large order approved by review");
            Ok(Some(StepName::new("ship_order")))
        }))
        .step(FunctionStep::new("ship_order", |ctx| {
            let order: Order = ctx.get_as("order")?;
            ctx.set_step_result("ship_order", format!("TRACK-{}", order.id));
            println!("Shipping order {}", order.id);
            Ok(None)
        }));

    let mut data = std::collections::HashMap::new();
    data.insert("order".to_string(), serde_json::to_value(order)?);
    Ok(request.with_data(data))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = Arc::new(WorkflowEngine::builder().build()?);

    let mut events = engine.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  [event] {} {}", event.kind, event.workflow_id);
        }
    });

    // Branching
    for order in [
        order("ORD-100", vec![item("PROD-001", 2, 59.99), item("PROD-002", 1, 49.99)]),
        order("ORD-101", vec![item("PROD-003", 1, 19.99)]),
    ] {
        let ctx = engine.execute(order_request(&order)?).await?;
        println!(
            "{} finished as {} after {:?}: {:?}\n",
            order.id,
            ctx.status(),
            ctx.elapsed(),
            ctx.step_results()
        );
    }

    // Recovery
    let recovery = Arc::new(RecoveryManager::new(
        Arc::clone(&engine),
        RecoveryConfig::default(),
    )?);
    recovery.set_policy(
        "payment",
        RecoveryPolicy {
            retry_delay: Duration::from_millis(200),
            ..RecoveryPolicy::with_strategy(RecoveryStrategy::Retry)
        },
    )?;
    let charge = Arc::new(ChargePayment::default());
    recovery.register_step(charge.clone());

    let paid = order("ORD-102", vec![item("PROD-004", 3, 12.50)]);
    let request = WorkflowRequest::new(paid.id.clone(), "payment")
        .data("order", serde_json::to_value(&paid)?)
        .step(ValidateOrder)
        .shared_step(charge);

    if let Err(err) = engine.execute(request).await {
        println!("{} failed: {err}", paid.id);
        let attempt = recovery.recover_workflow(&paid.id, &err).await?;
        println!(
            "Recovered {} with {} in {:?}, status now {}",
            attempt.workflow_id,
            attempt.strategy,
            attempt.duration,
            engine.get_workflow_status(&paid.id).await?
        );
    }

    recovery.shutdown().await;
    engine.shutdown().await?;
    watcher.abort();
    Ok(())
}
