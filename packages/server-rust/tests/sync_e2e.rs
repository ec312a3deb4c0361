//! End-to-end sync over real websockets: a server on an ephemeral port, an
//! in-memory stack behind it, and tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use viewsync_core::data::make_row;
use viewsync_core::messages::{
    decode, encode, Downstream, Encoding, ErrorKind, InitConnectionBody, Mutation, PokeBody,
    PushBody, QueryPatchOp, RowPatchOp, Upstream, CRUD_MUTATION_NAME,
};
use viewsync_core::{Ast, Row, Value};
use viewsync_server::dispatcher::Dispatcher;
use viewsync_server::network::{NetworkConfig, NetworkModule};
use viewsync_server::replication::ChangeSourceEvent;
use viewsync_server::{Stack, StackConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    port: u16,
    stack: Stack,
    stop: Option<oneshot::Sender<()>>,
    _signal: watch::Sender<bool>,
}

fn issue(id: i64, title: &str) -> Row {
    make_row([("id", Value::from(id)), ("title", title.into())])
}

async fn start() -> Server {
    let (signal, signal_rx) = watch::channel(false);
    let stack = Stack::start(&StackConfig::in_memory("e2e"), &signal_rx)
        .await
        .unwrap();

    // The query below needs the table to exist in the replica.
    let upstream = stack.upstream.clone().unwrap();
    upstream
        .commit(vec![ChangeSourceEvent::Insert {
            table: "issue".into(),
            row: issue(1, "first"),
        }])
        .unwrap();
    let replica = Arc::clone(stack.replicator.replica());
    timeout(Duration::from_secs(5), async {
        while replica.watermark().await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("seed transaction was not replicated");

    let mut network = NetworkModule::new(NetworkConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..NetworkConfig::default()
    });
    let port = network.start().await.unwrap();
    let dispatcher = Arc::new(Dispatcher::single(Arc::clone(&stack.pool)));
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        network
            .serve(dispatcher, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    Server {
        port,
        stack,
        stop: Some(stop),
        _signal: signal,
    }
}

impl Server {
    fn url(&self, path: &str, client: &str) -> String {
        format!(
            "ws://127.0.0.1:{}{path}?clientID={client}&clientGroupID=g1&ts=1&lmid=0&wsid=w-{client}",
            self.port
        )
    }

    async fn connect(&self, client: &str) -> Socket {
        let (socket, _) = connect_async(self.url("/api/sync/v1/connect", client))
            .await
            .unwrap();
        socket
    }
}

async fn send(socket: &mut Socket, message: &Upstream) {
    let json = serde_json::to_string(message).unwrap();
    socket.send(Message::text(json)).await.unwrap();
}

async fn recv(socket: &mut Socket) -> Downstream {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Binary(bytes) => return decode(&bytes, Encoding::MsgPack).unwrap(),
            Message::Close(frame) => panic!("closed: {frame:?}"),
            _ => {}
        }
    }
}

async fn recv_poke(socket: &mut Socket) -> PokeBody {
    match recv(socket).await {
        Downstream::Poke(poke) => poke,
        other => panic!("expected a poke, got {other:?}"),
    }
}

async fn handshake(socket: &mut Socket) -> PokeBody {
    match recv(socket).await {
        Downstream::Connected(body) => assert!(body.wsid.starts_with("w-")),
        other => panic!("expected connected, got {other:?}"),
    }
    recv_poke(socket).await
}

fn desire_issues() -> Upstream {
    Upstream::InitConnection(InitConnectionBody {
        desired_queries_patch: vec![QueryPatchOp::put("issues", Ast::table("issue"))],
    })
}

fn create_issue(id: u64, issue_id: i64, title: &str) -> Upstream {
    Upstream::Push(PushBody {
        client_group_id: "g1".into(),
        mutations: vec![Mutation {
            id,
            client_id: "c1".into(),
            name: CRUD_MUTATION_NAME.into(),
            args: serde_json::json!({"ops": [{
                "op": "create",
                "tableName": "issue",
                "primaryKey": ["id"],
                "value": {"id": issue_id, "title": title},
            }]}),
            timestamp: 0,
        }],
        push_version: 1,
        request_id: format!("r{id}"),
        timestamp: 0,
    })
}

#[tokio::test]
async fn push_round_trips_to_every_client_of_the_group() {
    let mut server = start().await;
    let mut alice = server.connect("c1").await;
    handshake(&mut alice).await;
    send(&mut alice, &desire_issues()).await;
    let hydrated = recv_poke(&mut alice).await;
    assert!(hydrated.rows_patch.contains(&RowPatchOp::Put {
        table_name: "issue".into(),
        value: issue(1, "first"),
    }));

    let mut bob = server.connect("c2").await;
    let bob_first = handshake(&mut bob).await;
    assert_eq!(bob_first.cookie, hydrated.cookie);

    send(&mut alice, &create_issue(1, 2, "second")).await;
    for socket in [&mut alice, &mut bob] {
        let poke = recv_poke(socket).await;
        assert_eq!(poke.base_cookie.as_deref(), Some(hydrated.cookie.as_str()));
        assert_eq!(
            poke.rows_patch,
            vec![RowPatchOp::Put {
                table_name: "issue".into(),
                value: issue(2, "second"),
            }]
        );
        assert_eq!(poke.last_mutation_id_changes.get("c1"), Some(&1));
    }

    send(&mut alice, &create_issue(3, 3, "gap")).await;
    match recv(&mut alice).await {
        Downstream::Error(body) => assert_eq!(body.kind, ErrorKind::InvalidPush),
        other => panic!("expected an error, got {other:?}"),
    }

    if let Some(stop) = server.stop.take() {
        let _ = stop.send(());
    }
    assert_eq!(server.stack.pool.len(), 1);
}

#[tokio::test]
async fn replies_use_the_client_encoding() {
    let server = start().await;
    let mut socket = server.connect("c1").await;
    handshake(&mut socket).await;

    let ping = encode(&Upstream::Ping, Encoding::MsgPack).unwrap();
    socket.send(Message::binary(ping)).await.unwrap();
    let frame = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(bytes) = frame else {
        panic!("expected a binary frame, got {frame:?}");
    };
    assert_eq!(decode::<Downstream>(&bytes, Encoding::MsgPack).unwrap(), Downstream::Pong);
}

#[tokio::test]
async fn bad_connect_requests_get_an_error_then_close() {
    let server = start().await;
    let (mut socket, _) = connect_async(server.url("/api/sync/v7/connect", "c1"))
        .await
        .unwrap();
    match recv(&mut socket).await {
        Downstream::Error(body) => {
            assert_eq!(body.kind, ErrorKind::InvalidConnectionRequest);
            assert!(body.message.contains("protocol version"));
        }
        other => panic!("expected an error, got {other:?}"),
    }
    let next = timeout(Duration::from_secs(5), socket.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
}

#[tokio::test]
async fn reconnecting_with_a_cookie_skips_known_rows() {
    let server = start().await;
    let mut socket = server.connect("c1").await;
    handshake(&mut socket).await;
    send(&mut socket, &desire_issues()).await;
    let hydrated = recv_poke(&mut socket).await;
    drop(socket);

    let url = format!(
        "{}&baseCookie={}",
        server.url("/api/sync/v1/connect", "c1"),
        hydrated.cookie
    );
    let (mut socket, _) = connect_async(url).await.unwrap();
    assert!(matches!(recv(&mut socket).await, Downstream::Connected(_)));

    send(&mut socket, &Upstream::Ping).await;
    loop {
        match recv(&mut socket).await {
            Downstream::Pong => break,
            Downstream::Poke(poke) => {
                assert_eq!(poke.base_cookie.as_deref(), Some(hydrated.cookie.as_str()));
                assert!(!poke
                    .rows_patch
                    .iter()
                    .any(|op| matches!(op, RowPatchOp::Put { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
