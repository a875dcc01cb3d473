use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use portal_notify::{
    ConnectionState, NotificationClient, NotificationEvent, NotificationSubscription,
    ReconnectPolicy, StreamConfig,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const TEST_TOKEN: &str = "abc";
const STREAM_PATH: &str = "/ws/notifications/";
const APPLICATION_STATUS: &str = r#"{"type":"application_status","jobId":42}"#;
const INTERVIEW_INVITE: &str = r#"{"type":"interview_invite","jobId":7}"#;

#[derive(Clone, Debug)]
enum Step {
    Send(String),
    SendBinary(String),
    Sleep(Duration),
    /// Drop the socket without a close handshake.
    Drop,
    /// Keep the socket open until the client goes away, counting close
    /// frames.
    Hold,
}

fn send(text: &str) -> Step {
    Step::Send(text.to_string())
}

#[derive(Clone)]
struct MockState {
    expected_token: Option<String>,
    reject_first: usize,
    handshake_delay: Duration,
    scripts: Arc<Vec<Vec<Step>>>,
    connections: Arc<AtomicUsize>,
    upgrades: Arc<AtomicUsize>,
    seen_tokens: Arc<Mutex<Vec<Option<String>>>>,
    close_frames: Arc<AtomicUsize>,
}

impl MockState {
    fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            expected_token: Some(TEST_TOKEN.to_string()),
            reject_first: 0,
            handshake_delay: Duration::ZERO,
            scripts: Arc::new(scripts),
            connections: Arc::new(AtomicUsize::new(0)),
            upgrades: Arc::new(AtomicUsize::new(0)),
            seen_tokens: Arc::new(Mutex::new(Vec::new())),
            close_frames: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn script_for(&self, upgrade: usize) -> Vec<Step> {
        let last = self.scripts.len().saturating_sub(1);
        self.scripts
            .get(upgrade.min(last))
            .cloned()
            .unwrap_or_else(|| vec![Step::Hold])
    }
}

struct MockServer {
    addr: SocketAddr,
    state: MockState,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    async fn start(state: MockState) -> Self {
        let app = Router::new()
            .route(STREAM_PATH, get(ws_handler))
            .with_state(state.clone());
        let (addr, shutdown_tx, task) = spawn_server(app).await;
        Self {
            addr,
            state,
            shutdown_tx,
            task,
        }
    }

    fn config(&self) -> StreamConfig {
        StreamConfig::new(STREAM_PATH)
            .with_base_url(format!("ws://{}", self.addr))
            .with_token(TEST_TOKEN)
            .with_reconnect_policy(ReconnectPolicy::fixed_steps(
                Duration::from_millis(10),
                Duration::from_millis(50),
            ))
            .with_handshake_timeout(Duration::from_secs(2))
    }

    fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    fn close_frames(&self) -> usize {
        self.state.close_frames.load(Ordering::SeqCst)
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = timeout(Duration::from_secs(2), self.task).await;
    }
}

fn collecting_client(
    config: StreamConfig,
) -> (NotificationClient, UnboundedReceiver<NotificationEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = NotificationClient::connect(config, move |event: NotificationEvent| {
        let _ = tx.send(event);
    })
    .expect("valid stream config");
    (client, rx)
}

async fn next_event(rx: &mut UnboundedReceiver<NotificationEvent>) -> NotificationEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

async fn wait_for_state(client: &NotificationClient, expected: ConnectionState) {
    let mut states = client.state_changes();
    let reached = timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == expected),
    )
    .await
    .expect("timed out waiting for state")
    .map(|_| ());
    assert!(reached.is_ok(), "state channel closed before {expected}");
}

async fn wait_for_worker(client: &NotificationClient) {
    timeout(Duration::from_secs(3), async {
        while !client.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream worker should stop after close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivers_notifications_in_order_and_drops_malformed_frames() {
    let server = MockServer::start(MockState::new(vec![vec![
        send("not json"),
        send(r#"{"jobId":1}"#),
        send(APPLICATION_STATUS),
        send(r#"["application_status"]"#),
        send(INTERVIEW_INVITE),
        Step::Hold,
    ]]))
    .await;

    let (client, mut rx) = collecting_client(server.config());

    let first = next_event(&mut rx).await;
    assert_eq!(
        first.to_value(),
        json!({"type": "application_status", "jobId": 42})
    );
    let second = next_event(&mut rx).await;
    assert_eq!(second.event_type(), "interview_invite");
    assert_eq!(second.get("jobId"), Some(&json!(7)));

    assert_eq!(client.state(), ConnectionState::Open);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "malformed frames must not be delivered");
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.connections(), 1);

    let tokens = server.state.seen_tokens.lock().await.clone();
    assert_eq!(tokens, vec![Some(TEST_TOKEN.to_string())]);

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    wait_for_worker(&client).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_server_drops_connection() {
    let server = MockServer::start(MockState::new(vec![
        vec![send(APPLICATION_STATUS), Step::Drop],
        vec![send(INTERVIEW_INVITE), Step::Hold],
    ]))
    .await;

    let (client, mut rx) = collecting_client(server.config());

    assert_eq!(next_event(&mut rx).await.event_type(), "application_status");
    assert_eq!(next_event(&mut rx).await.event_type(), "interview_invite");
    wait_for_state(&client, ConnectionState::Open).await;
    assert_eq!(server.connections(), 2);

    client.close();
    wait_for_worker(&client).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_handshakes_are_retried() {
    let mut state = MockState::new(vec![vec![send(APPLICATION_STATUS), Step::Hold]]);
    state.reject_first = 3;
    let server = MockServer::start(state).await;

    let (client, mut rx) = collecting_client(server.config());

    assert_eq!(next_event(&mut rx).await.event_type(), "application_status");
    assert_eq!(server.connections(), 4);
    assert_eq!(client.state(), ConnectionState::Open);

    client.close();
    wait_for_worker(&client).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_keeps_retrying_without_delivering() {
    let server = MockServer::start(MockState::new(vec![vec![
        send(APPLICATION_STATUS),
        Step::Hold,
    ]]))
    .await;

    let config = server.config().with_token("expired");
    let (client, mut rx) = collecting_client(config);

    timeout(Duration::from_secs(5), async {
        while server.connections() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client should keep retrying a rejected token");
    assert!(rx.try_recv().is_err());
    assert_ne!(client.state(), ConnectionState::Open);

    client.close();
    wait_for_worker(&client).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_while_open_stops_delivery() {
    let mut steps = vec![send(APPLICATION_STATUS)];
    for seq in 0..200 {
        steps.push(Step::Sleep(Duration::from_millis(5)));
        steps.push(Step::Send(json!({"type": "tick", "seq": seq}).to_string()));
    }
    steps.push(Step::Hold);
    let server = MockServer::start(MockState::new(vec![steps])).await;

    let (client, mut rx) = collecting_client(server.config());
    assert_eq!(next_event(&mut rx).await.event_type(), "application_status");
    assert_eq!(next_event(&mut rx).await.event_type(), "tick");

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    while rx.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "no delivery may happen after close");
    wait_for_worker(&client).await;
    assert_eq!(server.connections(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_reconnect_wait_cancels_retry() {
    let mut state = MockState::new(vec![vec![Step::Hold]]);
    state.reject_first = usize::MAX;
    let server = MockServer::start(state).await;

    let config = server
        .config()
        .with_reconnect_policy(ReconnectPolicy::fixed_steps(
            Duration::from_millis(300),
            Duration::from_millis(300),
        ));
    let (client, mut rx) = collecting_client(config);

    wait_for_state(&client, ConnectionState::ReconnectWait).await;
    let attempts = server.connections();
    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.connections(), attempts, "no attempt may start after close");
    assert!(rx.try_recv().is_err());
    wait_for_worker(&client).await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_before_handshake_never_opens() {
    let mut state = MockState::new(vec![vec![send(APPLICATION_STATUS), Step::Hold]]);
    state.handshake_delay = Duration::from_millis(200);
    let server = MockServer::start(state).await;

    let (client, mut rx) = collecting_client(server.config());
    assert_eq!(client.state(), ConnectionState::Connecting);
    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(rx.try_recv().is_err());
    wait_for_worker(&client).await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_accumulates_newest_first() {
    let server = MockServer::start(MockState::new(vec![vec![
        send(r#"{"type":"application_status","jobId":1}"#),
        send("{oops"),
        send(r#"{"type":"application_status","jobId":2}"#),
        send(r#"{"type":"new_message","from":"recruiter"}"#),
        Step::Hold,
    ]]))
    .await;

    let subscription = NotificationSubscription::open(server.config()).expect("open subscription");
    timeout(Duration::from_secs(5), async {
        while subscription.feed().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for feed");

    let kinds: Vec<String> = subscription
        .events()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec!["new_message", "application_status", "application_status"]
    );
    assert_eq!(
        subscription.feed().latest().and_then(|e| e.get("from").cloned()),
        Some(json!("recruiter"))
    );

    subscription.close();
    assert_eq!(subscription.state(), ConnectionState::Closed);
    assert_eq!(subscription.events().len(), 3);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_frames_are_delivered_like_text() {
    let server = MockServer::start(MockState::new(vec![vec![
        Step::SendBinary(APPLICATION_STATUS.to_string()),
        Step::SendBinary("\u{0}\u{1} not json".to_string()),
        send(INTERVIEW_INVITE),
        Step::Hold,
    ]]))
    .await;

    let (client, mut rx) = collecting_client(server.config());

    let first = next_event(&mut rx).await;
    assert_eq!(first.event_type(), "application_status");
    assert_eq!(first.get("jobId"), Some(&json!(42)));
    assert_eq!(next_event(&mut rx).await.event_type(), "interview_invite");
    assert_eq!(client.state(), ConnectionState::Open);

    client.close();
    wait_for_worker(&client).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_while_open_sends_close_frame() {
    let server = MockServer::start(MockState::new(vec![vec![
        send(APPLICATION_STATUS),
        Step::Hold,
    ]]))
    .await;

    let (client, mut rx) = collecting_client(server.config());
    assert_eq!(next_event(&mut rx).await.event_type(), "application_status");
    assert_eq!(server.close_frames(), 0);

    client.close();
    wait_for_worker(&client).await;
    timeout(Duration::from_secs(3), async {
        while server.close_frames() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server should receive a close frame");
    assert_eq!(server.close_frames(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_handshake_times_out_and_retries() {
    // Accepts TCP connections but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stalled listener");
    let addr = listener.local_addr().expect("read stalled listener address");
    let accepted = Arc::new(AtomicUsize::new(0));
    let accept_count = Arc::clone(&accepted);
    let acceptor = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            accept_count.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let config = StreamConfig::new(format!("ws://{addr}{STREAM_PATH}"))
        .with_token(TEST_TOKEN)
        .with_handshake_timeout(Duration::from_millis(100))
        .with_reconnect_policy(ReconnectPolicy::fixed_steps(
            Duration::from_millis(200),
            Duration::from_millis(200),
        ));
    let (client, mut rx) = collecting_client(config);
    assert_eq!(client.state(), ConnectionState::Connecting);

    wait_for_state(&client, ConnectionState::ReconnectWait).await;
    timeout(Duration::from_secs(5), async {
        while accepted.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client should retry after a handshake timeout");
    assert_ne!(client.state(), ConnectionState::Open);
    assert!(rx.try_recv().is_err());

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    wait_for_worker(&client).await;
    acceptor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_from_inside_handler_stops_after_current_notification() {
    let server = MockServer::start(MockState::new(vec![vec![
        Step::Sleep(Duration::from_millis(100)),
        send(APPLICATION_STATUS),
        send(INTERVIEW_INVITE),
        send(r#"{"type":"new_message"}"#),
        Step::Hold,
    ]]))
    .await;

    let slot: Arc<OnceLock<NotificationClient>> = Arc::new(OnceLock::new());
    let handler_slot = Arc::clone(&slot);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = NotificationClient::connect(server.config(), move |event: NotificationEvent| {
        let _ = tx.send(event);
        if let Some(client) = handler_slot.get() {
            client.close();
            assert_eq!(client.state(), ConnectionState::Closed);
            client.close();
        }
    })
    .expect("valid stream config");
    slot.set(client).expect("client slot is empty");
    let client = slot.get().expect("client slot is filled");

    assert_eq!(next_event(&mut rx).await.event_type(), "application_status");
    wait_for_worker(client).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rx.try_recv().is_err(),
        "no delivery may follow a close issued by the handler"
    );
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.connections(), 1);

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    server.stop().await;
}

async fn ws_handler(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    let token = query.get("token").cloned();
    state.seen_tokens.lock().await.push(token.clone());

    if connection < state.reject_first {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state.expected_token.is_some() && token != state.expected_token {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.handshake_delay.is_zero() {
        tokio::time::sleep(state.handshake_delay).await;
    }

    let upgrade = state.upgrades.fetch_add(1, Ordering::SeqCst);
    let steps = state.script_for(upgrade);
    let close_frames = Arc::clone(&state.close_frames);
    ws.on_upgrade(move |socket| run_script(socket, steps, close_frames))
        .into_response()
}

async fn run_script(mut socket: WebSocket, steps: Vec<Step>, close_frames: Arc<AtomicUsize>) {
    for step in steps {
        match step {
            Step::Send(text) => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Step::SendBinary(text) => {
                if socket
                    .send(Message::Binary(text.into_bytes().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Step::Sleep(delay) => tokio::time::sleep(delay).await,
            Step::Drop => return,
            Step::Hold => {
                while let Some(Ok(message)) = socket.recv().await {
                    if matches!(message, Message::Close(_)) {
                        close_frames.fetch_add(1, Ordering::SeqCst);
                    }
                }
                return;
            }
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
