//! HTTP surface against a live upstream generator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stream_gateway::backend::UpstreamBackend;
use stream_gateway::queue::RequestId;
use stream_gateway::{Gateway, GatewayConfig, HttpServer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

mod common;
use common::{ndjson_reply, start_generator, start_slow_generator};

struct TestGateway {
    addr: SocketAddr,
    gateway: Gateway,
    client: reqwest::Client,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn status(&self) -> Value {
        self.client
            .get(self.url("/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll `/status` until `ready` holds for its queue section.
    async fn wait_for_queue(&self, ready: impl Fn(&Value) -> bool) -> Value {
        let poll = async {
            loop {
                let status = self.status().await;
                if ready(&status["queue"]) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("queue never reached the expected state")
    }

    async fn generate(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/generate"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

/// Generator that echoes the prompt back in two parts, or fails when asked to.
async fn echo_generator() -> SocketAddr {
    start_generator(|path, body| {
        if path != "/generate" {
            return (200, "{}".to_string());
        }
        let request: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let prompt = request["prompt"].as_str().unwrap_or_default().to_string();
        if prompt.contains("explode") {
            let frame = json!({ "type": "error", "message": "generator crashed" });
            return (200, format!("{{\"type\":\"delta\",\"text\":\"par\"}}\n{frame}\n"));
        }
        (200, ndjson_reply(&["echo: ", prompt.as_str()]))
    })
    .await
}

async fn start_gateway(upstream: SocketAddr) -> TestGateway {
    start_gateway_with(upstream, GatewayConfig::default()).await
}

async fn start_gateway_with(upstream: SocketAddr, mut config: GatewayConfig) -> TestGateway {
    config.backend.url = format!("http://{upstream}");
    config.backend.start_attempts = 1;

    let backend = Arc::new(UpstreamBackend::new(&config.backend).unwrap());
    let gateway = Gateway::start(&config, backend).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config, gateway.manager().clone());
    tokio::spawn(server.run(listener, gateway.subscribe()));

    TestGateway {
        addr,
        gateway,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn test_batched_generation_returns_content() {
    let gw = start_gateway(echo_generator().await).await;

    let response = gw.generate(json!({ "prompt": "hello" })).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"], "echo: hello");
    assert_eq!(body["reason"], "completed");
    assert_eq!(body["received"], 2);

    let id = body["id"].as_str().unwrap();
    let status: Value = gw
        .client
        .get(gw.url(&format!("/status/requests/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "completed");

    gw.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chat_messages_are_rendered_into_prompt() {
    let gw = start_gateway(echo_generator().await).await;

    let response = gw
        .generate(json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" }
            ]
        }))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let content = body["content"].as_str().unwrap();
    assert!(content.starts_with("echo: "));
    assert!(content.contains("be brief"));
    assert!(content.contains("hi"));
}

#[tokio::test]
async fn test_streaming_generation_emits_sse_events_in_order() {
    let gw = start_gateway(echo_generator().await).await;

    let response = gw.generate(json!({ "prompt": "stream me", "stream": true })).await;
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = response.text().await.unwrap();
    let queued = text.find("event: queued").unwrap();
    let first_delta = text.find("event: delta").unwrap();
    let done = text.find("event: done").unwrap();
    assert!(queued < first_delta && first_delta < done);
    assert!(text.contains(r#""text":"stream me""#));
    assert!(text.contains(r#""reason":"completed""#));
}

#[tokio::test]
async fn test_generator_error_maps_to_bad_gateway() {
    let gw = start_gateway(echo_generator().await).await;

    let response = gw.generate(json!({ "prompt": "please explode" })).await;
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["reason"], "backend_error");
    assert_eq!(body["error"]["retryable"], false);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("generator crashed"));

    // The queue keeps serving after a failed generation.
    let response = gw.generate(json!({ "prompt": "again" })).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_empty_prompt_is_rejected() {
    let gw = start_gateway(echo_generator().await).await;

    let response = gw.generate(json!({ "prompt": "" })).await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["reason"], "invalid_request");

    let status: Value = gw
        .client
        .get(gw.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["queue"]["enqueued_total"], 0);
}

#[tokio::test]
async fn test_status_and_admin_endpoints() {
    let gw = start_gateway(echo_generator().await).await;

    let health = gw.client.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let status: Value = gw
        .client
        .get(gw.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "operational");
    assert_eq!(status["queue"]["depth"], 0);
    assert_eq!(status["queue"]["permits_held"], 0);
    assert!(status["queue"]["current"].is_null());

    let rotated: Value = gw
        .client
        .post(gw.url("/admin/rotate"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(rotated["superseded"].is_null());

    let unknown = RequestId::new().to_string();
    let response = gw
        .client
        .get(gw.url(&format!("/status/requests/{unknown}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = gw
        .client
        .get(gw.url("/status/requests/not-an-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_caller_that_hangs_up_while_waiting_is_evicted() {
    let upstream = start_slow_generator("slow", Duration::from_millis(1500)).await;
    let mut config = GatewayConfig::default();
    config.queue.sweep_interval_ms = 50;
    let gw = start_gateway_with(upstream, config).await;

    let holder = {
        let request = gw.client.post(gw.url("/v1/generate")).json(&json!({ "prompt": "first" }));
        tokio::spawn(async move { request.send().await.unwrap() })
    };
    gw.wait_for_queue(|queue| !queue["current"].is_null()).await;

    // Second caller speaks raw HTTP so it can hang up mid-wait.
    let body = json!({ "prompt": "second" }).to_string();
    let mut socket = TcpStream::connect(gw.addr).await.unwrap();
    let request = format!(
        "POST /v1/generate HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        gw.addr,
        body.len(),
        body
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    gw.wait_for_queue(|queue| queue["depth"] == 1).await;
    drop(socket);

    let status = gw
        .wait_for_queue(|queue| queue["evicted_total"].as_u64() >= Some(1))
        .await;
    assert_eq!(status["queue"]["depth"], 0);
    assert_eq!(status["queue"]["enqueued_total"], 2);

    let response = holder.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"], "slow");

    let status = gw
        .wait_for_queue(|queue| queue["processed_total"] == 1)
        .await;
    assert_eq!(status["queue"]["evicted_total"], 1);
}
