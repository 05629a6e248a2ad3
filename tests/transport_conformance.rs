//! Behaviour every `RpcTransport` must share, run against the in-memory one.

#[path = "common/mod.rs"]
mod common;

use common::node;
use kad_sdht::{MemoryNetwork, Message, MessageType, Node, RpcTransport};
use tokio::time::{timeout, Duration, Instant};

const WAIT: Duration = Duration::from_millis(200);

async fn request_reaches_peer_and_reply_resolves<T: RpcTransport>(
    a: &T,
    a_node: &Node,
    b: &T,
    b_node: &Node,
) {
    let request = Message::compose(a_node).to(b_node).find_node(b"target");
    let waiter = a.write(request.clone()).await.expect("write request");

    let inbound = timeout(WAIT, b.read())
        .await
        .expect("request delivered")
        .expect("transport open");
    assert_eq!(inbound.id, request.id);
    assert_eq!(inbound.kind, MessageType::FindNode);
    assert_eq!(inbound.find_key(), Some(&b"target"[..]));

    b.write(inbound.return_closest(vec![a_node.clone()]))
        .await
        .expect("write reply");
    let reply = waiter.wait(WAIT).await.expect("reply");
    assert!(reply.is_response);
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.closest(), Some(&[a_node.clone()][..]));
}

async fn responses_never_show_up_as_requests<T: RpcTransport>(
    a: &T,
    a_node: &Node,
    b: &T,
    b_node: &Node,
) {
    let stray = Message::compose(b_node).to(a_node).ping().pong();
    let waiter = a.write(stray).await.expect("write");
    assert!(waiter.wait(Duration::ZERO).await.is_none());
    assert!(timeout(Duration::from_millis(50), b.read()).await.is_err());
}

async fn unanswered_request_times_out<T: RpcTransport>(
    a: &T,
    a_node: &Node,
    b: &T,
    b_node: &Node,
) {
    let waiter = a
        .write(Message::compose(a_node).to(b_node).ping())
        .await
        .expect("write");
    // Peer reads the request but never answers.
    let _ = timeout(WAIT, b.read()).await;

    let started = Instant::now();
    assert!(waiter.wait(WAIT).await.is_none());
    assert!(started.elapsed() >= WAIT);
}

async fn late_reply_is_discarded<T: RpcTransport>(a: &T, a_node: &Node, b: &T, b_node: &Node) {
    let waiter = a
        .write(Message::compose(a_node).to(b_node).ping())
        .await
        .expect("write");
    let inbound = timeout(WAIT, b.read())
        .await
        .expect("request delivered")
        .expect("transport open");
    assert!(waiter.wait(Duration::from_millis(10)).await.is_none());

    // Answering after the waiter gave up must not resurface anywhere.
    b.write(inbound.pong()).await.expect("write");
    assert!(timeout(Duration::from_millis(50), a.read()).await.is_err());
}

#[tokio::test]
async fn memory_transport_conforms() {
    let network = MemoryNetwork::new();
    let (a_node, b_node) = (node("conformance-a"), node("conformance-b"));
    let a = network.register(&a_node);
    let b = network.register(&b_node);

    request_reaches_peer_and_reply_resolves(&a, &a_node, &b, &b_node).await;
    responses_never_show_up_as_requests(&a, &a_node, &b, &b_node).await;
    unanswered_request_times_out(&a, &a_node, &b, &b_node).await;
    late_reply_is_discarded(&a, &a_node, &b, &b_node).await;

    assert!(a.pending().is_empty());
    assert!(b.pending().is_empty());
}

#[tokio::test]
async fn memory_transport_drops_traffic_to_offline_peers() {
    let network = MemoryNetwork::new();
    let (a_node, b_node) = (node("offline-a"), node("offline-b"));
    let a = network.register(&a_node);
    let b = network.register(&b_node);
    network.set_offline(&b_node, true);

    let waiter = a
        .write(Message::compose(&a_node).to(&b_node).ping())
        .await
        .expect("write");
    assert!(timeout(Duration::from_millis(50), b.read()).await.is_err());
    assert!(waiter.wait(Duration::from_millis(50)).await.is_none());
    assert_eq!(network.requests_to(&b_node, MessageType::Ping), 0);
}

#[tokio::test]
async fn memory_transport_applies_latency() {
    let network = MemoryNetwork::new();
    let (a_node, b_node) = (node("slow-a"), node("slow-b"));
    let a = network.register(&a_node);
    let b = network.register(&b_node);
    network.set_latency(&b_node, Duration::from_millis(100));

    let started = Instant::now();
    a.write(Message::compose(&a_node).to(&b_node).ping())
        .await
        .expect("write");
    timeout(Duration::from_secs(1), b.read())
        .await
        .expect("delivered")
        .expect("open");
    assert!(started.elapsed() >= Duration::from_millis(100));
}
