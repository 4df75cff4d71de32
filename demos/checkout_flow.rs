//! Walks through a checkout with nested zones and prints every batch the
//! agent would send. Run with `RUST_LOG=debug` to see the agent's own logs.

use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use zonetrace::delivery::EncodedBatch;
use zonetrace::{Agent, AgentConfig, AgentEvent, CallSite, DeliveryError, JsAction, LifecyclePhase, Transport};

/// Prints batches instead of posting them.
struct StdoutTransport;

impl Transport for StdoutTransport {
    fn name(&self) -> &str {
        "stdout"
    }

    fn send<'a>(&'a self, batch: &'a EncodedBatch) -> BoxFuture<'a, Result<(), DeliveryError>> {
        async move {
            println!(
                "batch {} (seq {}..={}): {}",
                batch.id,
                batch.first_seq,
                batch.last_seq,
                String::from_utf8_lossy(&batch.body)
            );
            Ok(())
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let agent = Agent::builder("demo-account", LifecyclePhase::Development)
        .config(AgentConfig {
            batch_time_threshold: Duration::from_millis(500),
            ..AgentConfig::for_phase(LifecyclePhase::Development)
        })
        .destination("stdout", StdoutTransport)
        .start()?;

    let mut diagnostics = agent.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = diagnostics.recv().await {
            if let AgentEvent::BatchDelivered { destination, events, .. } = event {
                println!("-> {destination} accepted {events} events");
            }
        }
    });

    agent.set_user_class("beta-tester");
    agent.put_user_metadata("cart", "3 items");

    agent.start_zone("checkout");
    agent.add_marker("address form shown", CallSite::new("checkout.rs", "Checkout", "show_address", 12));

    agent.start_zone("paymentValidation");
    agent.add_marker_here("validating card");
    agent.report_exception("CardDeclined", "issuer refused the card", "validate_card\ncheckout");
    agent.stop_zone();

    agent.report_bug("user retried payment three times");
    agent
        .handle_from_js(
            JsAction::ReportJsError,
            &["undefined is not a function".into(), "pay.js".into(), "88".into()],
        )
        .await;
    agent.stop_zone();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let delivered = agent.send_now().await;
    println!("send_now: {delivered}");

    for (destination, stats) in agent.stats() {
        println!("{destination}: {stats:?}");
    }

    agent.shutdown().await;
    Ok(())
}
