//! Operator API served over a real socket

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_relayer::api::{router, ApiState};
use bridge_relayer::chain::ChainError;
use bridge_relayer::engine::EngineHandle;
use bridge_relayer::store::{CheckpointStore, MemoryStore};
use alloy::primitives::Address;
use bridge_relayer::types::{AssetKind, TransferStatus};
use common::*;
use reqwest::StatusCode;
use serde_json::{json, Value};

const TOKEN: &str = "s3cret-operator-token";

async fn serve(engine: EngineHandle, admin_token: Option<&str>) -> String {
    let state = ApiState {
        engine,
        admin_token: admin_token.map(Arc::from),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_status_and_transfer_lookup() {
    let source = MockSource::new("sepolia", "amoy");
    let dest = MockDest::new("amoy");
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let event = source.lock(4, 3, 0);
    source.set_head(10);

    let running = start(engine(store.clone(), source, dest, signer()));
    let base = serve(running.handle.clone(), None).await;
    let client = reqwest::Client::new();

    assert!(wait_for_status(&store, &event, TransferStatus::Confirmed).await);
    assert!(wait_for_checkpoint(&store, &chain("sepolia"), 8).await);

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["store_available"], true);
    let sepolia = &health["per_chain"]["sepolia"];
    assert!(sepolia["last_processed_block"].as_u64().unwrap() >= 8);
    assert_eq!(sepolia["pending_count"], 0);
    assert_eq!(sepolia["reorg_flagged"], false);

    let by_id: Value = client
        .get(format!("{base}/transfers/{}", event.event_id()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_id["status"], "confirmed");
    assert_eq!(by_id["event"]["nonce"], 4);

    let by_nonce: Value = client
        .get(format!("{base}/transfers/sepolia/nonce/4"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_nonce["event_id"], by_id["event_id"]);

    let listed: Vec<Value> = client
        .get(format!("{base}/transfers?status=confirmed&limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let resp = client
        .get(format!("{base}/transfers/sepolia/nonce/99"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .get(format!("{base}/transfers?status=lost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("relayer_transfers_total"));

    // Admin routes are not mounted without a token
    let resp = client
        .post(format!("{base}/admin/checkpoints/sepolia"))
        .json(&json!({ "block": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    running.stop().await;
}

#[tokio::test]
async fn test_admin_requeue_requires_token() {
    let source = MockSource::new("sepolia", "amoy");
    let dest = MockDest::new("amoy");
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());

    dest.push_error(ChainError::from_message("execution reverted: Invalid signature"));
    let event = source.lock(1, 3, 0);
    source.set_head(10);

    let running = start(engine(store.clone(), source, dest.clone(), signer()));
    let base = serve(running.handle.clone(), Some(TOKEN)).await;
    let client = reqwest::Client::new();

    assert!(wait_for_status(&store, &event, TransferStatus::Failed).await);
    let url = format!("{base}/admin/transfers/{}/requeue", event.event_id());

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let resp = client
        .post(&url)
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client.post(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record: Value = resp.json().await.unwrap();
    assert_eq!(record["status"], "pending");

    assert!(wait_for_status(&store, &event, TransferStatus::Confirmed).await);
    assert_eq!(dest.attempts(1), 2);

    // Only FAILED transfers can be requeued
    let resp = client.post(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    running.stop().await;
}

#[tokio::test]
async fn test_admin_checkpoint_reset() {
    let source = MockSource::new("sepolia", "amoy");
    let dest = MockDest::new("amoy");
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    source.set_head(10);

    let running = start(engine(store.clone(), source, dest, signer()));
    let base = serve(running.handle.clone(), Some(TOKEN)).await;
    let client = reqwest::Client::new();
    assert!(wait_for_checkpoint(&store, &chain("sepolia"), 8).await);

    let resp = client
        .post(format!("{base}/admin/checkpoints/bsc"))
        .bearer_auth(TOKEN)
        .json(&json!({ "block": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{base}/admin/checkpoints/sepolia"))
        .bearer_auth(TOKEN)
        .json(&json!({ "block": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "chain": "sepolia", "block": 3 }));

    // The watcher rescans from block 4 and commits again
    assert!(wait_for_checkpoint(&store, &chain("sepolia"), 8).await);

    running.stop().await;
}

#[tokio::test]
async fn test_account_history_and_bridge_scoped_nonce() {
    let source = MockSource::with_bridges("sepolia", "amoy", vec![erc20_bridge(), nft_bridge()]);
    let dest = MockDest::new("amoy");
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());

    let token = source.lock(1, 3, 0);
    let nft = source.emit_from(nft_bridge(), 1, 4, 0, AssetKind::NonFungible);
    source.set_head(10);

    let running = start(engine(store.clone(), source, dest, signer()));
    let base = serve(running.handle.clone(), None).await;
    let client = reqwest::Client::new();
    assert!(wait_for_status(&store, &token, TransferStatus::Confirmed).await);
    assert!(wait_for_status(&store, &nft, TransferStatus::Confirmed).await);

    let history: Vec<Value> = client
        .get(format!("{base}/transfers/account/{:#x}", token.account))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r["status"] == "confirmed"));

    let limited: Vec<Value> = client
        .get(format!("{base}/transfers/account/{}?limit=1", token.account))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let stranger: Vec<Value> = client
        .get(format!("{base}/transfers/account/{:#x}", Address::repeat_byte(0x33)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stranger.is_empty());

    let resp = client
        .get(format!("{base}/transfers/account/not-an-address"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Both bridges used nonce 1
    let resp = client
        .get(format!("{base}/transfers/sepolia/nonce/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let scoped: Value = client
        .get(format!("{base}/transfers/sepolia/nonce/1?bridge={:#x}", nft_bridge()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(scoped["event_id"], nft.event_id().to_string());

    running.stop().await;
}
