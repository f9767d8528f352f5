// Demo: a two-way traffic crossing driven through a few calls

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis::{EngineConfig, GraphDecl, Handler, LeafCall, Machine, Plan, Reply};

/// One traffic light: Red → Green → Yellow → Red on every tick.
fn light() -> Plan {
    let advance = |arrow: &'static str| {
        Handler::new()
            .on("tick", move |_call: LeafCall| async move {
                Ok(Reply::new().with_arrow(arrow))
            })
            .on_unsynchronized("color", |call: LeafCall| async move {
                Ok(Reply::new().with_result(call.node.id.rsplit(':').next().unwrap_or_default()))
            })
    };

    Plan::new("light")
        .graph(
            "main",
            GraphDecl::new()
                .node("Red")
                .node("Green")
                .node("Yellow")
                .arrow("Red", "go", "Green")
                .arrow("Green", "slow", "Yellow")
                .arrow("Yellow", "stop", "Red"),
        )
        .leaf("Red")
        .leaf("Green")
        .leaf("Yellow")
        .bind("main:Red", advance("go"))
        .bind("main:Green", advance("slow"))
        .bind("main:Yellow", advance("stop"))
}

fn crossing() -> Plan {
    Plan::new("crossing")
        .graph(
            "main",
            GraphDecl::new()
                .node("Operating")
                .node("Maintenance")
                .arrow("Operating", "service", "Maintenance")
                .arrow_via("Maintenance", "resume", "Operating", "history"),
        )
        .composite("Operating", ["North", "East"])
        .external("North", light())
        .external("East", light())
        .leaf("Maintenance")
        .bind(
            "main:Operating",
            Handler::new()
                .on("service", |_call: LeafCall| async move {
                    Ok(Reply::new().with_arrow("service"))
                })
                .on("afterLeft", |call: LeafCall| async move {
                    let mut ctx = call.ctx;
                    let visits = ctx["service_visits"].as_u64().unwrap_or(0) + 1;
                    ctx["service_visits"] = json!(visits);
                    Ok(Reply::new().with_ctx(ctx))
                }),
        )
        .bind(
            "main:Maintenance",
            Handler::new().on("resume", |_call: LeafCall| async move {
                Ok(Reply::new().with_arrow("resume"))
            }),
        )
}

async fn report(machine: &Machine, instance: &str, label: &str) -> Result<Value> {
    let colors = machine
        .call(instance, "color", json!({}))
        .await
        .context("Failed to read light colors")?;
    let state = machine
        .state(instance)
        .await
        .context("Failed to read crossing state")?;
    tracing::info!(
        step = label,
        mode = state.active_child("main").unwrap_or("-"),
        colors = %colors,
        context = %state.context,
        revision = state.revision,
        "crossing state"
    );
    Ok(colors)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trellis=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let machine = Machine::builder(crossing()).with_config(config).build();
    let instance = "crossing-1";

    report(&machine, instance, "start").await?;

    for _ in 0..2 {
        machine
            .call(instance, "tick", json!({}))
            .await
            .context("Failed to advance lights")?;
    }
    report(&machine, instance, "after two ticks").await?;

    machine
        .call(instance, "service", json!({}))
        .await
        .context("Failed to enter maintenance")?;
    report(&machine, instance, "maintenance").await?;

    machine
        .call(instance, "resume", json!({}))
        .await
        .context("Failed to resume operation")?;
    report(&machine, instance, "resumed").await?;

    Ok(())
}
