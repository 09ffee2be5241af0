//! Failing listing pages must degrade to empty results, never propagate.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pricewatch_catalog::{PageFetcher, PageParams};
use pricewatch_core::CategoryRef;
use pricewatch_storage::{HttpClientConfig, HttpFetcher, RetryPolicy};

fn test_fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                max_attempts: 5,
                delay: Duration::from_millis(10),
            },
            ..Default::default()
        })
        .expect("building http fetcher"),
    )
}

fn category() -> CategoryRef {
    CategoryRef {
        name: "Dresses".into(),
        shard: "dresses_shard".into(),
        query: "cat=8126".into(),
    }
}

fn params() -> PageParams {
    PageParams {
        page: 1,
        low_price: 100,
        top_price: 1000,
        discount: None,
    }
}

/// Serves `500` to every connection and counts how many it saw.
fn spawn_error_server(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding loopback listener");
    let addr = listener.local_addr().expect("listener address");
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            hits.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn all_attempts_failing_yields_an_empty_page() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_error_server(hits.clone());
    let pages = PageFetcher::new(test_fetcher()).with_base_url(base_url);

    let records = pages.fetch_page(&category(), params()).await;

    assert!(records.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn connection_refused_yields_an_empty_page() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding loopback listener");
        listener.local_addr().expect("listener address")
    };
    let pages = PageFetcher::new(test_fetcher()).with_base_url(format!("http://{addr}"));

    let records = pages.fetch_page(&category(), params()).await;

    assert!(records.is_empty());
}
