use elif_realtime::connection::DuplexChannel;
use elif_realtime::hub::{decode, HubConnectionContext};
use elif_realtime::{
    BackplaneHubLifetimeManager, CompletionMessage, ConnectionId, HubLifetimeManager,
    HubLifetimeManagerExt, HubMessage, MemoryBackplane, RealtimeConfigBuilder, RealtimeError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Server = Arc<BackplaneHubLifetimeManager<MemoryBackplane>>;

async fn servers(count: usize) -> Vec<Server> {
    let config = RealtimeConfigBuilder::testing()
        .build()
        .expect("Failed to build config");
    let backplane = Arc::new(MemoryBackplane::new());
    let mut servers = Vec::with_capacity(count);
    for _ in 0..count {
        let manager = BackplaneHubLifetimeManager::new(backplane.clone(), &config)
            .await
            .expect("Failed to start server");
        servers.push(Arc::new(manager));
    }
    servers
}

/// The client end of a hub connection living on one server
struct Client {
    id: ConnectionId,
    channel: DuplexChannel,
}

impl Client {
    async fn connect(server: &Server, id: &str, user_id: Option<&str>) -> Self {
        let channel = DuplexChannel::new(8, 8);
        let id = ConnectionId::from(id);
        server
            .on_connected(HubConnectionContext::new(
                id.clone(),
                user_id.map(str::to_string),
                channel.application(),
            ))
            .await
            .unwrap();
        Self { id, channel }
    }

    async fn receive(&self) -> HubMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), self.channel.transport().read())
            .await
            .expect("Timed out waiting for a message")
            .expect("Channel closed");
        decode_first(&frame)
    }

    async fn assert_silent(&self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.channel.transport().read()).await;
        assert!(next.is_err(), "Unexpected message for {}", self.id);
    }
}

fn decode_first(frame: &[u8]) -> HubMessage {
    decode(frame).unwrap().remove(0)
}

fn target_and_args(message: HubMessage) -> (Option<String>, String, Vec<serde_json::Value>) {
    match message {
        HubMessage::Invocation(invocation) => (
            invocation.invocation_id,
            invocation.target,
            invocation.arguments,
        ),
        other => panic!("Expected an invocation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_connection_across_servers_delivers_once() {
    let servers = servers(2).await;
    let client = Client::connect(&servers[0], "c1", None).await;

    servers[1]
        .send_connection(&client.id, "Notify", vec![json!("hello")])
        .await
        .unwrap();

    let (_, target, args) = target_and_args(client.receive().await);
    assert_eq!(target, "Notify");
    assert_eq!(args, vec![json!("hello")]);
    client.assert_silent().await;
}

#[tokio::test]
async fn test_send_all_reaches_every_connection_once() {
    let servers = servers(3).await;
    let first = Client::connect(&servers[0], "c1", None).await;
    let second = Client::connect(&servers[1], "c2", None).await;

    servers[2]
        .send_all("Broadcast", vec![json!(1)])
        .await
        .unwrap();

    for client in [&first, &second] {
        let (_, target, _) = target_and_args(client.receive().await);
        assert_eq!(target, "Broadcast");
        client.assert_silent().await;
    }
}

#[tokio::test]
async fn test_send_all_except_skips_excluded() {
    let servers = servers(2).await;
    let first = Client::connect(&servers[0], "c1", None).await;
    let second = Client::connect(&servers[1], "c2", None).await;

    servers[0]
        .send_all_except("Broadcast", vec![], &[first.id.clone()])
        .await
        .unwrap();

    second.receive().await;
    first.assert_silent().await;
}

#[tokio::test]
async fn test_send_user_spans_servers() {
    let servers = servers(3).await;
    let phone = Client::connect(&servers[0], "c1", Some("alice")).await;
    let laptop = Client::connect(&servers[1], "c2", Some("alice")).await;
    let other = Client::connect(&servers[1], "c3", Some("bob")).await;

    servers[2]
        .send_user("alice", "Direct", vec![json!("hi alice")])
        .await
        .unwrap();

    for client in [&phone, &laptop] {
        let (_, target, args) = target_and_args(client.receive().await);
        assert_eq!(target, "Direct");
        assert_eq!(args, vec![json!("hi alice")]);
    }
    other.assert_silent().await;
}

#[tokio::test]
async fn test_remote_group_membership_is_acknowledged() {
    let servers = servers(2).await;
    let client = Client::connect(&servers[0], "c1", None).await;

    servers[1].add_to_group(&client.id, "room").await.unwrap();
    servers[1]
        .send_group("room", "RoomMessage", vec![json!("welcome")])
        .await
        .unwrap();
    let (_, target, _) = target_and_args(client.receive().await);
    assert_eq!(target, "RoomMessage");

    servers[1].remove_from_group(&client.id, "room").await.unwrap();
    servers[1]
        .send_group("room", "RoomMessage", vec![])
        .await
        .unwrap();
    client.assert_silent().await;
}

#[tokio::test]
async fn test_group_change_for_unknown_connection_times_out() {
    let servers = servers(2).await;

    let err = servers[1]
        .add_to_group(&ConnectionId::from("nobody"), "room")
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::Timeout(_)));
}

#[tokio::test]
async fn test_disconnect_leaves_groups() {
    let servers = servers(2).await;
    let client = Client::connect(&servers[0], "c1", None).await;
    servers[0].add_to_group(&client.id, "room").await.unwrap();

    servers[0].on_disconnected(&client.id).await.unwrap();
    servers[1]
        .send_group("room", "RoomMessage", vec![])
        .await
        .unwrap();
    client.assert_silent().await;
}

#[tokio::test]
async fn test_concurrent_invocations_resolve_to_their_callers() {
    let servers = servers(3).await;
    let client = Client::connect(&servers[0], "c1", None).await;

    let responder = {
        let server = servers[0].clone();
        let channel = client.channel.clone();
        let id = client.id.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                let frame = channel.transport().read().await.unwrap();
                let (invocation_id, _, args) = target_and_args(decode_first(&frame));
                let completion =
                    CompletionMessage::with_result(invocation_id.unwrap(), args[0].clone());
                server.set_connection_result(&id, completion).await.unwrap();
            }
        })
    };

    let (five, two) = tokio::join!(
        servers[1].invoke_connection::<i64>(
            &client.id,
            "Compute",
            vec![json!(5)],
            CancellationToken::new()
        ),
        servers[2].invoke_connection::<i64>(
            &client.id,
            "Compute",
            vec![json!(2)],
            CancellationToken::new()
        ),
    );
    assert_eq!(five.unwrap(), 5);
    assert_eq!(two.unwrap(), 2);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_invoking_unknown_connection_fails_fast() {
    let servers = servers(2).await;

    let result = tokio::time::timeout(
        Duration::from_millis(200),
        servers[1].invoke_connection_raw(
            &ConnectionId::from("ghost"),
            "Compute",
            vec![],
            CancellationToken::new(),
        ),
    )
    .await
    .expect("Invocation should not wait");
    assert!(matches!(result, Err(RealtimeError::ConnectionNotFound { .. })));
}

#[tokio::test]
async fn test_invoking_just_disconnected_connection_fails_fast() {
    let servers = servers(2).await;
    let client = Client::connect(&servers[0], "c1", None).await;
    servers[0].on_disconnected(&client.id).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        servers[1].invoke_connection_raw(&client.id, "Compute", vec![], CancellationToken::new()),
    )
    .await
    .expect("Invocation should not wait for a connection that is gone");
    assert!(matches!(result, Err(RealtimeError::ConnectionNotFound { .. })));
    client.assert_silent().await;
}

#[tokio::test]
async fn test_disconnect_fails_routed_invocation() {
    let servers = servers(2).await;
    let client = Client::connect(&servers[0], "c1", None).await;

    let pending = {
        let caller = servers[1].clone();
        let id = client.id.clone();
        tokio::spawn(async move {
            caller
                .invoke_connection_raw(&id, "Compute", vec![], CancellationToken::new())
                .await
        })
    };

    let (invocation_id, target, _) = target_and_args(client.receive().await);
    assert!(invocation_id.is_some());
    assert_eq!(target, "Compute");

    servers[0].on_disconnected(&client.id).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("Invocation should fail once the connection is gone")
        .unwrap();
    assert!(matches!(
        result,
        Err(RealtimeError::ConnectionDisconnected { .. })
    ));
}

#[tokio::test]
async fn test_completion_from_wrong_connection_is_rejected() {
    let servers = servers(1).await;
    let target = Client::connect(&servers[0], "c1", None).await;
    let imposter = Client::connect(&servers[0], "c2", None).await;

    let pending = {
        let server = servers[0].clone();
        let id = target.id.clone();
        tokio::spawn(async move {
            server
                .invoke_connection::<String>(&id, "Name", vec![], CancellationToken::new())
                .await
        })
    };

    let (invocation_id, _, _) = target_and_args(target.receive().await);
    let invocation_id = invocation_id.unwrap();

    let err = servers[0]
        .set_connection_result(
            &imposter.id,
            CompletionMessage::with_result(invocation_id.clone(), json!("mallory")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::InvalidCompletion(_)));

    servers[0]
        .set_connection_result(
            &target.id,
            CompletionMessage::with_result(invocation_id, json!("alice")),
        )
        .await
        .unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), "alice");
}

#[tokio::test]
async fn test_canceled_invocation_stops_waiting() {
    let servers = servers(1).await;
    let client = Client::connect(&servers[0], "c1", None).await;
    let cancellation = CancellationToken::new();

    let pending = {
        let server = servers[0].clone();
        let id = client.id.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            server
                .invoke_connection_raw(&id, "Slow", vec![], cancellation)
                .await
        })
    };

    client.receive().await;
    cancellation.cancel();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RealtimeError::InvocationCanceled)));
}
