//! Loopback relay used by the async test suites.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::constants::{RELAY_PUBLISH, RELAY_SUBSCRIBE, RELAY_SUBSCRIPTION, RELAY_UNSUBSCRIBE};

/// Spawns a minimal in-process relay and returns its `ws://` url.
///
/// Subscribes are acknowledged with `sub-<topic>`, unsubscribes with `true`,
/// and every publish is echoed back to the same client as an
/// `iridium_subscription` notification before its ack. That makes the
/// publishing client its own peer, which is exactly what the round-trip
/// tests need.
pub(crate) async fn fake_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let mut notification_id = 900_000u64;
                while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let Some(method) = frame["method"].as_str() else {
                        continue; // client acks need no reply
                    };
                    let id = frame["id"].clone();
                    let response = match method {
                        RELAY_SUBSCRIBE => {
                            let topic = frame["params"]["topic"].as_str().unwrap();
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": format!("sub-{topic}")
                            })
                        }
                        RELAY_UNSUBSCRIBE => {
                            json!({"jsonrpc": "2.0", "id": id, "result": true})
                        }
                        RELAY_PUBLISH => {
                            let params = frame["params"].clone();
                            notification_id += 1;
                            let notification = json!({
                                "jsonrpc": "2.0",
                                "id": notification_id,
                                "method": RELAY_SUBSCRIPTION,
                                "params": {
                                    "id": format!("sub-{}", params["topic"].as_str().unwrap()),
                                    "data": {
                                        "topic": params["topic"],
                                        "message": params["message"],
                                        "publishedAt": 1700000000000u64,
                                        "tag": params["tag"],
                                    }
                                }
                            });
                            ws.send(WsMessage::Text(notification.to_string()))
                                .await
                                .unwrap();
                            json!({"jsonrpc": "2.0", "id": id, "result": true})
                        }
                        _ => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32601, "message": "method not found"}
                        }),
                    };
                    ws.send(WsMessage::Text(response.to_string())).await.unwrap();
                }
            });
        }
    });
    format!("ws://{addr}")
}
