//! Minimal smoke demo: dispatch a couple of short requests through a
//! `UrlDispatcher` and print what comes back. Not a CLI surface — just
//! enough wiring to exercise the crate end to end.

use std::sync::Arc;

use async_trait::async_trait;
use gatekeeper::{
    DispatcherConfig, GatekeeperError, Operation, OperationDelegate, RequestClass, RequestSpec,
    ResponseMeta, UrlDispatcher,
};

struct PrintingDelegate;

#[async_trait]
impl OperationDelegate for PrintingDelegate {
    async fn did_receive_response(&self, op: &Operation, response: &ResponseMeta) {
        println!("[{}] {} -> {}", op.id(), op.request().url, response.status);
    }

    async fn did_receive_data(&self, op: &Operation, chunk: &[u8]) {
        println!("[{}] received {} bytes", op.id(), chunk.len());
    }

    async fn did_finish(&self, op: &Operation) {
        println!("[{}] finished", op.id());
    }

    async fn did_fail(&self, op: &Operation, error: &GatekeeperError) {
        println!("[{}] failed: {error}", op.id());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    gatekeeper::logging::init_tracing();

    let dispatcher = UrlDispatcher::new(DispatcherConfig::default().from_env());
    let delegate = Arc::new(PrintingDelegate);

    for url in ["https://httpbin.org/get", "https://httpbin.org/status/204"] {
        let request = RequestSpec::get(reqwest::Url::parse(url)?);
        let op = dispatcher
            .dispatch_synchronous(RequestClass::Short, request, true, delegate.clone())
            .await?;
        println!("operation {} reached state {:?}", op.id(), op.state());
    }

    println!(
        "dispatcher metrics: {}",
        serde_json::to_string(&dispatcher.metrics())?
    );
    Ok(())
}
