//! End-to-end scenarios over an in-memory transport pair
//!
//! Cross-connection timing is made deterministic by using ack round-trips
//! as ordering barriers: once a peer's ack resolves, every frame the server
//! queued for that peer beforehand has already been dispatched.

use serde_json::{json, Value};
use sparkmux::{
    memory_pair, Client, ConnectionId, Frame, FrameBody, FrameTransport, MuxError, Server, Spark,
    CLOSE_EVENT, DATA_EVENT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(server: &Server) -> (Client, ConnectionId) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (local, remote) = memory_pair();
    let connection_id = server.accept(remote).await;
    (Client::connect(local), connection_id)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("sender dropped")
}

/// Installs the handlers the broadcast scenarios rely on: `join` adds the
/// spark to the requested room, `broadcast`/`broadcast_emit` fan out to the
/// requested rooms, `ping` just acks back.
async fn install_room_handlers(spark: Arc<Spark>) {
    let peer = Arc::clone(&spark);
    spark
        .on("join", move |payload, reply| {
            let peer = Arc::clone(&peer);
            async move {
                peer.join(payload.as_str().unwrap()).await.unwrap();
                if let Some(reply) = reply {
                    reply.send(json!("joined"));
                }
            }
        })
        .await;

    let peer = Arc::clone(&spark);
    spark
        .on("broadcast", move |payload, reply| {
            let peer = Arc::clone(&peer);
            async move {
                peer.room(payload.as_str().unwrap()).write(json!("hi")).await;
                if let Some(reply) = reply {
                    reply.send(json!("sent"));
                }
            }
        })
        .await;

    let peer = Arc::clone(&spark);
    spark
        .on("broadcast_emit", move |payload, reply| {
            let peer = Arc::clone(&peer);
            async move {
                peer.room(payload.as_str().unwrap())
                    .emit("msg", json!("hi"))
                    .await;
                if let Some(reply) = reply {
                    reply.send(json!("sent"));
                }
            }
        })
        .await;

    spark
        .on("ping", |_, reply| async move {
            if let Some(reply) = reply {
                reply.send(json!("pong"));
            }
        })
        .await;
}

#[tokio::test]
async fn connection_event_fires_once_per_channel_open() {
    let server = Server::new();
    let group = server.channel("a").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    group
        .on_connection(move |spark| {
            let tx = tx.clone();
            async move {
                tx.send(spark.id()).unwrap();
            }
        })
        .await;

    let (client, _) = connect(&server).await;
    let _channel = client.channel("a").await.unwrap();

    let first = recv(&mut rx).await;

    // Re-requesting the same channel is idempotent and fires nothing new
    let again = client.channel("a").await.unwrap();
    assert!(Arc::ptr_eq(&_channel, &again));
    assert!(rx.try_recv().is_err());

    // A second client opening the channel yields a distinct spark
    let (other, _) = connect(&server).await;
    let _other_channel = other.channel("a").await.unwrap();
    let second = recv(&mut rx).await;
    assert_ne!(first, second);
}

#[tokio::test]
async fn server_emits_to_client_with_payload_intact() {
    let server = Server::new();
    let group = server.channel("a").await;

    group
        .on_connection(|spark| async move {
            let peer = Arc::clone(&spark);
            spark
                .on("ready", move |_, reply| {
                    let peer = Arc::clone(&peer);
                    async move {
                        peer.emit("msg", json!({ "hi": "hello", "n": [1, 2, { "k": true }] }))
                            .await
                            .unwrap();
                        if let Some(reply) = reply {
                            reply.send(json!(null));
                        }
                    }
                })
                .await;
        })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel
        .on("msg", move |payload, _| {
            let tx = tx.clone();
            async move {
                tx.send(payload).unwrap();
            }
        })
        .await;

    let ack = channel.emit_with_ack("ready", json!(null)).await.unwrap();
    timeout(WAIT, ack).await.unwrap().unwrap();

    // The emit was queued before the ack reply, so it has been dispatched
    assert_eq!(
        rx.try_recv().unwrap(),
        json!({ "hi": "hello", "n": [1, 2, { "k": true }] })
    );
}

#[tokio::test]
async fn client_emits_to_server_with_payload_intact() {
    let server = Server::new();
    let group = server.channel("a").await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    group
        .on_connection(move |spark| {
            let tx = tx.clone();
            async move {
                let tx = tx.clone();
                spark
                    .on("msg", move |payload, _| {
                        let tx = tx.clone();
                        async move {
                            tx.send(payload).unwrap();
                        }
                    })
                    .await;
            }
        })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();
    channel
        .emit("msg", json!({ "hi": "hello" }))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, json!({ "hi": "hello" }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn ack_round_trip_client_to_server() {
    let server = Server::new();
    let group = server.channel("a").await;

    group
        .on_connection(|spark| async move {
            spark
                .on("msg", |payload, reply| async move {
                    if let Some(reply) = reply {
                        if payload == json!({ "hi": "hello" }) {
                            reply.send(json!("thanks"));
                        } else {
                            reply.send(json!("unexpected payload"));
                        }
                    }
                })
                .await;
        })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    let ack = channel
        .emit_with_ack("msg", json!({ "hi": "hello" }))
        .await
        .unwrap();
    assert_eq!(timeout(WAIT, ack).await.unwrap().unwrap(), json!("thanks"));
}

#[tokio::test]
async fn ack_round_trip_server_to_client() {
    let server = Server::new();
    let group = server.channel("a").await;

    let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
    group
        .on_connection(move |spark| {
            let handle_tx = handle_tx.clone();
            async move {
                let peer = Arc::clone(&spark);
                let handle_tx = handle_tx.clone();
                spark
                    .on("ready", move |_, _| {
                        let peer = Arc::clone(&peer);
                        let handle_tx = handle_tx.clone();
                        async move {
                            let handle = peer
                                .emit_with_ack("msg", json!({ "hi": "hello" }))
                                .await
                                .unwrap();
                            handle_tx.send(handle).unwrap();
                        }
                    })
                    .await;
            }
        })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    channel
        .on("msg", move |payload, reply| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(payload).unwrap();
                if let Some(reply) = reply {
                    reply.send(json!("thanks"));
                }
            }
        })
        .await;

    channel.emit("ready", json!(null)).await.unwrap();

    let handle = recv(&mut handle_rx).await;
    assert_eq!(
        timeout(WAIT, handle).await.unwrap().unwrap(),
        json!("thanks")
    );
    assert_eq!(recv(&mut seen_rx).await, json!({ "hi": "hello" }));
}

#[tokio::test]
async fn room_write_reaches_a_member() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    let (member, _) = connect(&server).await;
    let member_channel = member.channel("a").await.unwrap();
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    member_channel
        .on(DATA_EVENT, move |payload, _| {
            let data_tx = data_tx.clone();
            async move {
                data_tx.send(payload).unwrap();
            }
        })
        .await;

    let join = member_channel
        .emit_with_ack("join", json!("r1"))
        .await
        .unwrap();
    timeout(WAIT, join).await.unwrap().unwrap();

    let (sender, _) = connect(&server).await;
    let sender_channel = sender.channel("a").await.unwrap();
    let sent = sender_channel
        .emit_with_ack("broadcast", json!("r1"))
        .await
        .unwrap();
    timeout(WAIT, sent).await.unwrap().unwrap();

    assert_eq!(recv(&mut data_rx).await, json!("hi"));
}

#[tokio::test]
async fn multi_room_write_is_exactly_once_per_member() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    // First member joins two of the addressed rooms; it must still
    // receive a single copy
    let mut members = Vec::new();
    let mut receivers = Vec::new();
    for rooms in [vec!["r1", "r2"], vec!["r2"], vec!["r3"]] {
        let (client, _) = connect(&server).await;
        let channel = client.channel("a").await.unwrap();

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        channel
            .on(DATA_EVENT, move |payload, _| {
                let data_tx = data_tx.clone();
                async move {
                    data_tx.send(payload).unwrap();
                }
            })
            .await;

        for room in rooms {
            let join = channel.emit_with_ack("join", json!(room)).await.unwrap();
            timeout(WAIT, join).await.unwrap().unwrap();
        }

        members.push((client, channel));
        receivers.push(data_rx);
    }

    // An outsider connection in no room triggers the fan-out
    let (outsider, _) = connect(&server).await;
    let outsider_channel = outsider.channel("a").await.unwrap();
    let (outsider_tx, mut outsider_rx) = mpsc::unbounded_channel();
    outsider_channel
        .on(DATA_EVENT, move |payload, _| {
            let outsider_tx = outsider_tx.clone();
            async move {
                outsider_tx.send(payload).unwrap();
            }
        })
        .await;

    let sent = outsider_channel
        .emit_with_ack("broadcast", json!("r1 r2 r3"))
        .await
        .unwrap();
    timeout(WAIT, sent).await.unwrap().unwrap();

    for data_rx in &mut receivers {
        assert_eq!(recv(data_rx).await, json!("hi"));
    }

    // Ping barrier per member: once it resolves, any duplicate copy would
    // already have been dispatched
    for (_, channel) in &members {
        let ping = channel.emit_with_ack("ping", json!(null)).await.unwrap();
        timeout(WAIT, ping).await.unwrap().unwrap();
    }
    for data_rx in &mut receivers {
        assert!(data_rx.try_recv().is_err());
    }

    let ping = outsider_channel
        .emit_with_ack("ping", json!(null))
        .await
        .unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
    assert!(outsider_rx.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_emit_reaches_every_member_and_no_one_else() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    let mut receivers = Vec::new();
    let mut channels = Vec::new();
    for room in ["r1", "r2", "r3"] {
        let (client, _) = connect(&server).await;
        let channel = client.channel("a").await.unwrap();

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        channel
            .on("msg", move |payload, _| {
                let msg_tx = msg_tx.clone();
                async move {
                    msg_tx.send(payload).unwrap();
                }
            })
            .await;

        let join = channel.emit_with_ack("join", json!(room)).await.unwrap();
        timeout(WAIT, join).await.unwrap().unwrap();

        channels.push((client, channel));
        receivers.push(msg_rx);
    }

    // This client joined no room and must receive nothing
    let (bystander, _) = connect(&server).await;
    let bystander_channel = bystander.channel("a").await.unwrap();
    let (bystander_tx, mut bystander_rx) = mpsc::unbounded_channel();
    bystander_channel
        .on("msg", move |payload, _| {
            let bystander_tx = bystander_tx.clone();
            async move {
                bystander_tx.send(payload).unwrap();
            }
        })
        .await;

    let sent = bystander_channel
        .emit_with_ack("broadcast_emit", json!("r1 r2"))
        .await
        .unwrap();
    timeout(WAIT, sent).await.unwrap().unwrap();

    assert_eq!(recv(&mut receivers[0]).await, json!("hi"));
    assert_eq!(recv(&mut receivers[1]).await, json!("hi"));

    // r3 was not addressed; barrier then assert silence
    let ping = channels[2]
        .1
        .emit_with_ack("ping", json!(null))
        .await
        .unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
    assert!(receivers[2].try_recv().is_err());

    let ping = bystander_channel
        .emit_with_ack("ping", json!(null))
        .await
        .unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
    assert!(bystander_rx.try_recv().is_err());
}

#[tokio::test]
async fn channels_on_one_connection_are_independent() {
    let server = Server::new();
    let group_a = server.channel("a").await;
    let group_b = server.channel("b").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (group, tag) in [(group_a, "a"), (group_b, "b")] {
        let tx = tx.clone();
        group
            .on_connection(move |spark| {
                let tx = tx.clone();
                async move {
                    let tx = tx.clone();
                    spark
                        .on("msg", move |payload, reply| {
                            let tx = tx.clone();
                            async move {
                                tx.send((tag, payload)).unwrap();
                                if let Some(reply) = reply {
                                    reply.send(json!(null));
                                }
                            }
                        })
                        .await;
                }
            })
            .await;
    }

    let (client, _) = connect(&server).await;
    let channel_a = client.channel("a").await.unwrap();
    let channel_b = client.channel("b").await.unwrap();

    let ack = channel_b.emit_with_ack("msg", json!("to b")).await.unwrap();
    timeout(WAIT, ack).await.unwrap().unwrap();
    let ack = channel_a.emit_with_ack("msg", json!("to a")).await.unwrap();
    timeout(WAIT, ack).await.unwrap().unwrap();

    assert_eq!(recv(&mut rx).await, ("b", json!("to b")));
    assert_eq!(recv(&mut rx).await, ("a", json!("to a")));
}

#[tokio::test]
async fn pending_ack_is_abandoned_when_server_disconnects() {
    let server = Server::new();
    let group = server.channel("a").await;

    // The server accepts the event but never replies
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    group
        .on_connection(move |spark| {
            let seen_tx = seen_tx.clone();
            async move {
                let seen_tx = seen_tx.clone();
                spark
                    .on("msg", move |_, _reply| {
                        let seen_tx = seen_tx.clone();
                        async move {
                            seen_tx.send(()).unwrap();
                        }
                    })
                    .await;
            }
        })
        .await;

    let (client, connection_id) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    channel
        .on(CLOSE_EVENT, move |_, _| {
            let closed_tx = closed_tx.clone();
            async move {
                closed_tx.send(()).unwrap();
            }
        })
        .await;

    let pending = channel.emit_with_ack("msg", json!("hi")).await.unwrap();
    recv(&mut seen_rx).await;

    server.close_connection(connection_id).await.unwrap();

    assert!(matches!(
        timeout(WAIT, pending).await.unwrap(),
        Err(MuxError::AckAbandoned)
    ));
    // The disconnect surfaced locally as the channel's close event
    recv(&mut closed_rx).await;
    assert_eq!(server.stats().await.connections, 0);
}

#[tokio::test]
async fn pending_ack_is_abandoned_when_client_disconnects() {
    let server = Server::new();
    let group = server.channel("a").await;

    let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
    group
        .on_connection(move |spark| {
            let handle_tx = handle_tx.clone();
            async move {
                let peer = Arc::clone(&spark);
                let handle_tx = handle_tx.clone();
                spark
                    .on("ready", move |_, _| {
                        let peer = Arc::clone(&peer);
                        let handle_tx = handle_tx.clone();
                        async move {
                            let handle =
                                peer.emit_with_ack("msg", json!("hi")).await.unwrap();
                            handle_tx.send(handle).unwrap();
                        }
                    })
                    .await;
            }
        })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();
    // No "msg" handler on the client, so no reply will ever come
    channel.emit("ready", json!(null)).await.unwrap();

    let pending = recv(&mut handle_rx).await;
    client.close().await;

    assert!(matches!(
        timeout(WAIT, pending).await.unwrap(),
        Err(MuxError::AckAbandoned)
    ));
}

#[tokio::test]
async fn disconnect_clears_room_membership_and_sparks() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();
    for room in ["r1", "r2"] {
        let join = channel.emit_with_ack("join", json!(room)).await.unwrap();
        timeout(WAIT, join).await.unwrap().unwrap();
    }

    let stats = server.stats().await;
    assert_eq!(stats.sparks, 1);
    assert_eq!(stats.rooms, 2);

    client.close().await;

    // Teardown runs on the server's connection loop; poll until it lands
    timeout(WAIT, async {
        loop {
            let stats = server.stats().await;
            if stats.sparks == 0 && stats.rooms == 0 && stats.connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never cleaned up the disconnected client");
}

#[tokio::test]
async fn closing_one_channel_leaves_others_live() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;
    let group_b = server.channel("b").await;
    group_b
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    let (client, _) = connect(&server).await;
    let channel_a = client.channel("a").await.unwrap();
    let channel_b = client.channel("b").await.unwrap();

    let ping = channel_a.emit_with_ack("ping", json!(null)).await.unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
    let ping = channel_b.emit_with_ack("ping", json!(null)).await.unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
    assert_eq!(server.stats().await.sparks, 2);

    channel_a.close().await;
    assert!(matches!(
        channel_a.emit("msg", json!(1)).await,
        Err(MuxError::ChannelClosed)
    ));

    // The sibling channel keeps working after the close lands server-side
    let ping = channel_b.emit_with_ack("ping", json!(null)).await.unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();

    timeout(WAIT, async {
        while server.stats().await.sparks != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never tore down the closed channel's spark");

    // Requesting the closed name again opens a fresh channel
    let reopened = client.channel("a").await.unwrap();
    assert!(!Arc::ptr_eq(&channel_a, &reopened));
    let ping = reopened.emit_with_ack("ping", json!(null)).await.unwrap();
    timeout(WAIT, ping).await.unwrap().unwrap();
}

#[tokio::test]
async fn server_initiated_room_broadcast() {
    let server = Server::new();
    let group = server.channel("a").await;
    group
        .on_connection(|spark| async move { install_room_handlers(spark).await })
        .await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    channel
        .on("msg", move |payload, _| {
            let msg_tx = msg_tx.clone();
            async move {
                msg_tx.send(payload).unwrap();
            }
        })
        .await;

    let join = channel.emit_with_ack("join", json!("r1")).await.unwrap();
    timeout(WAIT, join).await.unwrap().unwrap();

    let target = server.room("r1");
    assert_eq!(target.clients().await.len(), 1);
    let result = target.emit("msg", json!("hi")).await;
    assert_eq!(result.delivered, 1);

    assert_eq!(recv(&mut msg_rx).await, json!("hi"));
    assert_eq!(server.rooms().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn stale_ack_does_not_subscribe_a_channel() {
    let server = Server::new();
    let group = server.channel("a").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    group
        .on_connection(move |spark| {
            let tx = tx.clone();
            async move {
                tx.send(spark.id()).unwrap();
            }
        })
        .await;

    let (mut local, remote) = memory_pair();
    server.accept(remote).await;

    // An ack for a channel this connection never opened is stale; the
    // server must drop it without creating a spark
    local
        .send(Frame::new(
            "a",
            FrameBody::Ack {
                id: 99,
                payload: json!("stale"),
            },
        ))
        .await
        .unwrap();
    // Frames are routed in order, so by the time the open lands the
    // stale ack has already been processed
    local.send(Frame::new("a", FrameBody::Open)).await.unwrap();

    recv(&mut rx).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(server.stats().await.sparks, 1);
}

#[tokio::test]
async fn emit_after_close_fails_fast() {
    let server = Server::new();
    let _group = server.channel("a").await;

    let (client, _) = connect(&server).await;
    let channel = client.channel("a").await.unwrap();

    client.close().await;

    assert!(matches!(
        channel.emit("msg", json!(1)).await,
        Err(MuxError::ChannelClosed)
    ));
    assert!(matches!(
        client.channel("b").await,
        Err(MuxError::ConnectionClosed)
    ));
}
