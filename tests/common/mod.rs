//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use stream_gateway::backend::GenerationBackend;
use stream_gateway::error::GatewayResult;
use stream_gateway::lifecycle::Shutdown;
use stream_gateway::net::{connection_pair, ConnectionGuard, ConnectionProbe};
use stream_gateway::queue::{GenerationParams, GenerationRequest, QueueManager, QueueSettings, RequestId};
use stream_gateway::stream::{channel_source, ChannelSource, RawEventSource, SourceFeed, SourcePoll};
use stream_gateway::GatewayError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum Step {
    Fragment(&'static str),
    Wait(Duration),
    Busy(bool),
    Finish,
    Fail(&'static str),
    Hang,
}

/// What the scripted backend does for one `start` call.
#[derive(Debug, Clone)]
pub enum Script {
    Play(Vec<Step>),
    RefuseStart(&'static str),
    PanicOnStart,
}

impl Script {
    pub fn reply(text: &'static str) -> Self {
        Script::Play(vec![Step::Fragment(text), Step::Finish])
    }
}

/// Backend that plays scripts in order and records what it was asked to do.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    starts: Mutex<Vec<RequestId>>,
    control: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn started(&self) -> Vec<RequestId> {
        self.starts.lock().unwrap().clone()
    }

    pub fn control_calls(&self) -> Vec<String> {
        self.control.lock().unwrap().clone()
    }

    /// Highest number of live generation sources seen at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl GenerationBackend for ScriptedBackend {
    fn start<'a>(
        &'a self,
        id: RequestId,
        _request: &'a GenerationRequest,
    ) -> BoxFuture<'a, GatewayResult<Box<dyn RawEventSource>>> {
        Box::pin(async move {
            self.starts.lock().unwrap().push(id);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Script::reply("ok"));

            let steps = match script {
                Script::Play(steps) => steps,
                Script::RefuseStart(message) => {
                    return Err(GatewayError::Backend(message.to_string()))
                }
                Script::PanicOnStart => panic!("scripted backend panic"),
            };

            let (feed, source) = channel_source(64);
            let reader = tokio::spawn(play(steps, feed));

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(TrackedSource {
                inner: source.with_reader(reader),
                active: self.active.clone(),
            }) as Box<dyn RawEventSource>)
        })
    }

    fn switch_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, GatewayResult<()>> {
        self.control.lock().unwrap().push(format!("model:{model}"));
        Box::pin(async { Ok(()) })
    }

    fn apply_params<'a>(&'a self, _params: &'a GenerationParams) -> BoxFuture<'a, GatewayResult<()>> {
        self.control.lock().unwrap().push("params".to_string());
        Box::pin(async { Ok(()) })
    }
}

async fn play(steps: Vec<Step>, feed: SourceFeed) {
    for step in steps {
        match step {
            Step::Fragment(text) => {
                if !feed.fragment(text).await {
                    return;
                }
            }
            Step::Wait(duration) => tokio::time::sleep(duration).await,
            Step::Busy(active) => feed.set_generating(active),
            Step::Finish => {
                feed.finish().await;
            }
            Step::Fail(message) => {
                feed.fail(message).await;
            }
            Step::Hang => std::future::pending::<()>().await,
        }
    }
}

/// Source wrapper that counts live generations; decrements synchronously on drop.
struct TrackedSource {
    inner: ChannelSource,
    active: Arc<AtomicUsize>,
}

impl RawEventSource for TrackedSource {
    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, SourcePoll> {
        self.inner.next_event(wait)
    }

    fn is_generating(&self) -> Option<bool> {
        self.inner.is_generating()
    }
}

impl Drop for TrackedSource {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live caller connection.
pub fn caller() -> (Arc<dyn ConnectionProbe>, ConnectionGuard) {
    let (connection, guard) = connection_pair();
    (Arc::new(connection), guard)
}

/// Queue manager with a running worker.
pub struct QueueHarness {
    pub manager: Arc<QueueManager>,
    pub shutdown: Shutdown,
    pub worker: JoinHandle<GatewayResult<()>>,
}

pub fn start_queue(backend: Arc<ScriptedBackend>, settings: QueueSettings) -> QueueHarness {
    let manager = Arc::new(QueueManager::new(backend, settings));
    let shutdown = Shutdown::new();
    let worker = tokio::spawn(manager.clone().run_worker(shutdown.subscribe()));
    QueueHarness {
        manager,
        shutdown,
        worker,
    }
}

/// Start a raw HTTP/1.1 generator on an ephemeral port.
///
/// `respond` maps `(path, body)` to `(status, body)`.
pub async fn start_generator<F>(respond: F) -> SocketAddr
where
    F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let respond = respond.clone();
                    tokio::spawn(async move {
                        let Some((path, body)) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, payload) = respond(&path, &body);
                        let status_text = match status {
                            200 => "200 OK",
                            400 => "400 Bad Request",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/x-ndjson\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            payload.len(),
                            payload
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Generator whose `/generate` sends one fragment, holds the body open for
/// `hold`, then finishes. Control endpoints answer `{}`.
pub async fn start_slow_generator(fragment: &'static str, hold: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some((path, _)) = read_request(&mut socket).await else {
                    return;
                };
                if path != "/generate" {
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                        .await;
                    let _ = socket.shutdown().await;
                    return;
                }
                // No Content-Length: the body runs until the socket closes.
                let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n";
                let first = serde_json::json!({ "type": "delta", "text": fragment });
                let _ = socket.write_all(format!("{head}{first}\n").as_bytes()).await;
                tokio::time::sleep(hold).await;
                let _ = socket.write_all(b"{\"type\":\"done\"}\n").await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

async fn read_request(socket: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let path = head.split_whitespace().nth(1)?.to_string();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + length {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[end + 4..]).to_string();
            return Some((path, body));
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// NDJSON body for a successful generation of `parts`.
pub fn ndjson_reply(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        body.push_str(&serde_json::json!({ "type": "delta", "text": part }).to_string());
        body.push('\n');
    }
    body.push_str("{\"type\":\"done\"}\n");
    body
}
