//! Shared test fixtures: in-process HTTP mocks and request capture.

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_mock(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let addr = listener.local_addr().expect("mock listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Bodies (or any JSON summary) captured by mock handlers, in arrival order.
#[derive(Clone, Default)]
pub struct RecordedRequests(Arc<Mutex<Vec<Value>>>);

impl RecordedRequests {
    pub fn push(&self, value: Value) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(value);
    }

    pub fn all(&self) -> Vec<Value> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A listener that accepts every connection and closes it before replying.
/// Returns the base URL and a count of accepted connections.
pub async fn spawn_dropping_listener() -> (String, Arc<AtomicU32>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind dropping listener");
    let addr = listener.local_addr().expect("dropping listener address");
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (format!("http://{}", addr), accepted)
}
