#![cfg(feature = "_async")]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::USER_AGENT;
use http::{HeaderMap, StatusCode};
use smartreq::{
    AsyncClient, AsyncConnection, AsyncTransportFactory, BlockingPolicy, Classification,
    Destination, ErrorCode, InsightsStore, PoolConfig, RetryAdvisor, TransportErrorKind,
    WireRequest, WireResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<Result<(u16, &'static str), io::ErrorKind>>,
    connects: usize,
    requests: Vec<WireRequest>,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    latency: Duration,
}

impl ScriptedTransport {
    fn new(outcomes: Vec<Result<(u16, &'static str), io::ErrorKind>>) -> Self {
        let transport = Self::default();
        transport.state.lock().expect("lock script").outcomes = outcomes.into();
        transport
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn connects(&self) -> usize {
        self.state.lock().expect("lock script").connects
    }

    fn requests(&self) -> Vec<WireRequest> {
        self.state.lock().expect("lock script").requests.clone()
    }
}

impl AsyncTransportFactory for ScriptedTransport {
    fn connect<'a>(
        &'a self,
        _destination: &'a Destination,
        _timeout: Duration,
    ) -> BoxFuture<'a, io::Result<Box<dyn AsyncConnection>>> {
        Box::pin(async move {
            self.state.lock().expect("lock script").connects += 1;
            Ok(Box::new(ScriptedConnection {
                transport: self.clone(),
            }) as Box<dyn AsyncConnection>)
        })
    }
}

struct ScriptedConnection {
    transport: ScriptedTransport,
}

impl AsyncConnection for ScriptedConnection {
    fn send<'a>(
        &'a mut self,
        request: &'a WireRequest,
        _timeout: Duration,
    ) -> BoxFuture<'a, io::Result<WireResponse>> {
        Box::pin(async move {
            if !self.transport.latency.is_zero() {
                tokio::time::sleep(self.transport.latency).await;
            }
            let outcome = {
                let mut state = self.transport.state.lock().expect("lock script");
                state.requests.push(request.clone());
                state.outcomes.pop_front()
            };
            match outcome {
                Some(Err(kind)) => Err(io::Error::from(kind)),
                Some(Ok((status, body))) => Ok(WireResponse {
                    status: StatusCode::from_u16(status).expect("valid status"),
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(body.as_bytes()),
                }),
                None => Ok(WireResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                }),
            }
        })
    }

    fn is_reusable(&self) -> bool {
        true
    }
}

fn instant_retries() -> RetryAdvisor {
    RetryAdvisor::standard()
        .challenge_delay(Duration::ZERO)
        .block_delay(Duration::ZERO)
}

fn scripted_client(transport: &ScriptedTransport) -> AsyncClient {
    AsyncClient::builder()
        .transport(transport.clone())
        .retry_advisor(instant_retries())
        .metrics_enabled(true)
        .try_build()
        .expect("build client")
}

#[tokio::test(flavor = "current_thread")]
async fn async_get_over_tcp_reuses_keep_alive_connection() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let address = listener.local_addr().expect("read local address");
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut served = 0;
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        while served < 2 {
            let read = stream.read(&mut chunk).await.expect("read request");
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            while let Some(end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                buffer.drain(..end + 4);
                served += 1;
                let body = format!("reply-{served}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                stream
                    .write_all(response.as_bytes())
                    .await
                    .expect("write response");
            }
        }
        served
    });

    let client = AsyncClient::builder()
        .retry_advisor(instant_retries())
        .try_build()
        .expect("build client");
    let url = format!("http://{address}/status");

    let first = client.get(&url).send().await.expect("first request");
    let second = client.get(&url).send().await.expect("second request");
    assert_eq!(first.text_lossy(), "reply-1");
    assert_eq!(second.text_lossy(), "reply-2");

    assert_eq!(server.await.expect("server task"), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn async_persistent_block_stops_after_five_attempts() {
    let transport = ScriptedTransport::new(vec![Ok((403, "forbidden")); 6]);
    let client = scripted_client(&transport);

    let response = client
        .get("http://blocked.example.com/")
        .send()
        .await
        .expect("final response");
    assert_eq!(response.classification(), Classification::Block);
    assert_eq!(response.attempts(), 5);

    let requests = transport.requests();
    assert_eq!(requests.len(), 5);
    let last_agent = requests[4]
        .headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .expect("user agent");
    assert!(last_agent.ends_with("(Retry-4)"));

    let insights = client.domain_insights("blocked.example.com");
    assert_eq!(insights.total_requests, 5);
    assert_eq!(client.metrics_snapshot().retries, 4);
}

#[tokio::test(flavor = "current_thread")]
async fn async_challenge_waits_for_the_advised_delay() {
    let transport = ScriptedTransport::new(vec![Ok((429, "turnstile")), Ok((200, "ok"))]);
    let client = AsyncClient::builder()
        .transport(transport.clone())
        .retry_advisor(
            RetryAdvisor::standard()
                .challenge_delay(Duration::from_millis(40))
                .block_delay(Duration::ZERO),
        )
        .try_build()
        .expect("build client");

    let started = tokio::time::Instant::now();
    let response = client
        .get("http://example.com/")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test(flavor = "current_thread")]
async fn async_transport_error_surfaces_after_learning() {
    let transport = ScriptedTransport::new(vec![Err(io::ErrorKind::TimedOut)]);
    let client = scripted_client(&transport);

    let error = client
        .get("http://slow.example.com/")
        .send()
        .await
        .expect_err("timeout surfaces");
    assert_eq!(error.code(), ErrorCode::Transport);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Timeout));

    let snapshot = client
        .insights()
        .snapshot("slow.example.com")
        .expect("recorded");
    assert_eq!(snapshot.failure_count, 1);
    assert!((snapshot.avg_delay_seconds - 0.6).abs() < 1e-9);
}

#[tokio::test(flavor = "current_thread")]
async fn async_stale_reused_connection_is_replaced() {
    let transport = ScriptedTransport::new(vec![
        Ok((200, "first")),
        Err(io::ErrorKind::BrokenPipe),
        Ok((200, "second")),
    ]);
    let client = scripted_client(&transport);

    client
        .get("http://example.com/")
        .send()
        .await
        .expect("first");
    let response = client
        .get("http://example.com/")
        .send()
        .await
        .expect("second");
    assert_eq!(response.text_lossy(), "second");
    assert_eq!(transport.connects(), 2);
    assert_eq!(client.metrics_snapshot().stale_connections, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn async_fail_fast_pool_rejects_concurrent_request() {
    let transport = ScriptedTransport::new(Vec::new()).with_latency(Duration::from_millis(50));
    let client = scripted_client(&transport);

    let (first, second) = tokio::join!(
        client.get("http://busy.example.com/").send(),
        client.get("http://busy.example.com/").send(),
    );
    assert!(first.is_ok());
    assert_eq!(
        second.expect_err("second request is rejected").code(),
        ErrorCode::PoolExhausted
    );
}

#[tokio::test(flavor = "current_thread")]
async fn async_block_policy_queues_concurrent_requests() {
    let transport = ScriptedTransport::new(Vec::new()).with_latency(Duration::from_millis(10));
    let client = AsyncClient::builder()
        .transport(transport.clone())
        .pool_config(PoolConfig::default().with_blocking_policy(BlockingPolicy::Block))
        .try_build()
        .expect("build client");

    let (first, second, third) = tokio::join!(
        client.get("http://queue.example.com/").send(),
        client.get("http://queue.example.com/").send(),
        client.get("http://queue.example.com/").send(),
    );
    assert!(first.is_ok() && second.is_ok() && third.is_ok());
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn async_clients_share_an_insights_store() {
    let store = Arc::new(InsightsStore::new());
    let transport = ScriptedTransport::new(Vec::new());
    let first = AsyncClient::builder()
        .transport(transport.clone())
        .insights_store(Arc::clone(&store))
        .try_build()
        .expect("build first client");
    let second = AsyncClient::builder()
        .transport(transport)
        .insights_store(Arc::clone(&store))
        .try_build()
        .expect("build second client");

    first
        .get("http://shared.example.com/")
        .send()
        .await
        .expect("first");
    second
        .get("http://shared.example.com/")
        .send()
        .await
        .expect("second");

    let insights = store.domain_insights("shared.example.com");
    assert_eq!(insights.total_requests, 2);
    assert_eq!(insights.success_rate, 1.0);
}

#[tokio::test(flavor = "current_thread")]
async fn async_https_without_tls_transport_fails_with_tls_kind() {
    let client = AsyncClient::builder()
        .retry_advisor(instant_retries())
        .try_build()
        .expect("build client");

    let error = client
        .get("https://secure.example.com/")
        .send()
        .await
        .expect_err("plain tcp transport cannot speak tls");
    assert_eq!(error.code(), ErrorCode::Connect);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Tls));
}
