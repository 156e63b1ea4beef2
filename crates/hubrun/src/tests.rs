use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::Barrier;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use hubpack::Codec;
use hubrpc::Fault;
use hubrpc::HubFrame;
use hubrpc::MethodId;
use hubrpc::Status;

use crate::config::SessionConfig;
use crate::filter::TypeRegistry;
use crate::hub::Groups;
use crate::hub::HubBuilder;
use crate::session::CallMode;
use crate::session::DuplexSession;
use crate::session::Error;
use crate::session::SessionBuilder;
use crate::session::SessionState;
use crate::transport::ChannelTransport;
use crate::transport::Transport;

const ECHO: MethodId = MethodId(1);

/// A client session wired to a scripted peer.
fn scripted(config: SessionConfig) -> (DuplexSession, Arc<ChannelTransport>) {
    let (local, remote) = ChannelTransport::pair();
    let session = SessionBuilder::new("client")
        .codec(Codec::text())
        .config(config)
        .open(Arc::new(local));
    (session, Arc::new(remote))
}

async fn next_frame(peer: &ChannelTransport) -> HubFrame {
    let bytes = tokio::time::timeout(Duration::from_secs(1), peer.recv())
        .await
        .expect("peer timed out")
        .unwrap()
        .expect("transport ended");
    HubFrame::decode(&bytes).unwrap()
}

async fn next_request(peer: &ChannelTransport) -> (u32, Vec<u8>) {
    match next_frame(peer).await {
        HubFrame::Request {
            correlation_id: Some(id),
            payload,
            ..
        } => (id, payload),
        other => panic!("expected a correlated request, got {:?}", other),
    }
}

async fn send_frame(peer: &ChannelTransport, frame: HubFrame) {
    peer.send(&frame.encode().unwrap()).await.unwrap();
}

fn is_status(result: &Result<u32, Error>, status: Status) -> bool {
    matches!(result, Err(Error::Fault(fault)) if fault.status == status)
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (session, peer) = scripted(SessionConfig::standard());
    let codec = Codec::text();

    let calls: Vec<_> = (0..64u32)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.call::<u32, u32>(ECHO, &i).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..64 {
        requests.push(next_request(&peer).await);
    }
    requests.shuffle(&mut rand::thread_rng());

    for (correlation_id, payload) in requests {
        let n: u32 = codec.decode(&payload).unwrap();
        let payload = codec.encode(&(n * 10)).unwrap();
        send_frame(&peer, HubFrame::Response { correlation_id, payload }).await;
    }

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), i as u32 * 10);
    }
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn test_correlation_ids_are_distinct_while_pending() {
    let (session, peer) = scripted(SessionConfig::standard());

    let mut replies = Vec::new();
    for i in 0..8u32 {
        let payload = session.codec().encode(&i).unwrap();
        replies.push(session.invoke(ECHO, payload, CallMode::Awaited).await.unwrap());
    }

    let mut ids: Vec<u32> = replies.iter().map(|r| r.correlation_id().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(session.pending_len(), 8);

    // dropping a handle abandons its entry
    drop(replies);
    assert_eq!(session.pending_len(), 0);
    drop(peer);
}

#[tokio::test]
async fn test_fire_and_forget_leaves_no_pending_entry() {
    let (session, peer) = scripted(SessionConfig::standard());

    session.send(ECHO, &5u32).await.unwrap();
    assert_eq!(session.pending_len(), 0);

    match next_frame(&peer).await {
        HubFrame::Request { correlation_id, .. } => assert_eq!(correlation_id, None),
        other => panic!("expected a request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fire_and_forget_handle_cannot_wait_or_cancel() {
    let (session, _peer) = scripted(SessionConfig::standard());
    let payload = session.codec().encode(&1u32).unwrap();

    let reply = session.invoke(ECHO, payload.clone(), CallMode::FireAndForget).await.unwrap();
    assert_eq!(reply.mode(), CallMode::FireAndForget);
    assert_eq!(reply.wait().await.unwrap_err(), Error::FireAndForget("wait"));

    let reply = session.invoke(ECHO, payload, CallMode::FireAndForget).await.unwrap();
    assert_eq!(reply.cancel().unwrap_err(), Error::FireAndForget("cancel"));
}

#[tokio::test]
async fn test_close_fails_every_pending_call() {
    let config = SessionConfig::standard().with_close_timeout(Duration::from_millis(50));
    let (session, peer) = scripted(config);

    let calls: Vec<_> = (0..5u32)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.call::<u32, u32>(ECHO, &i).await })
        })
        .collect();
    for _ in 0..5 {
        next_request(&peer).await;
    }
    assert_eq!(session.pending_len(), 5);

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.pending_len(), 0);

    for call in calls {
        match call.await.unwrap() {
            Err(Error::Fault(fault)) => assert!(fault.is_session_closed()),
            other => panic!("expected session closed, got {:?}", other),
        }
    }

    let late = session.call::<u32, u32>(ECHO, &1).await;
    assert!(is_status(&late, Status::Unavailable));
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending_calls() {
    let (session, peer) = scripted(SessionConfig::standard());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<u32, u32>(ECHO, &1).await })
    };
    next_request(&peer).await;

    peer.close().await;
    let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Fault(ref f)) if f.is_session_closed()));

    session.closed().await;
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn test_local_close_notifies_the_peer() {
    let (session, peer) = scripted(SessionConfig::standard());
    session.close().await;

    assert_eq!(next_frame(&peer).await, HubFrame::Close { reason: None });
}

#[tokio::test]
async fn test_peer_close_frame_drains_then_closes() {
    let (session, peer) = scripted(SessionConfig::standard());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<u32, u32>(ECHO, &4).await })
    };
    let (correlation_id, _) = next_request(&peer).await;

    send_frame(&peer, HubFrame::Close { reason: Some("bye".into()) }).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state(), SessionState::Closing);

    // new work is refused while in-flight work still completes
    let refused = session.call::<u32, u32>(ECHO, &5).await;
    assert!(is_status(&refused, Status::Unavailable));

    let payload = session.codec().encode(&40u32).unwrap();
    send_frame(&peer, HubFrame::Response { correlation_id, payload }).await;
    assert_eq!(call.await.unwrap().unwrap(), 40);

    tokio::time::timeout(Duration::from_secs(1), session.closed()).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_push_dispatch_by_method_id() {
    let (session, peer) = scripted(SessionConfig::standard());
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_push(MethodId(42), move |text: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(text);
        }
    });

    let codec = session.codec();
    send_frame(
        &peer,
        HubFrame::Push {
            method_id: MethodId(999),
            payload: codec.encode(&"nobody listens").unwrap(),
        },
    )
    .await;
    send_frame(
        &peer,
        HubFrame::Push {
            method_id: MethodId(42),
            payload: codec.encode(&"hi").unwrap(),
        },
    )
    .await;

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(received.as_deref(), Some("hi"));
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_timeout_resolves_locally_and_late_reply_is_discarded() {
    let (session, peer) = scripted(SessionConfig::standard());

    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call_timeout::<u32, u32>(ECHO, &7, Duration::from_millis(30))
                .await
        })
    };
    let (correlation_id, _) = next_request(&peer).await;

    let result = call.await.unwrap();
    assert_eq!(result.unwrap_err(), Error::Fault(Fault::timeout()));
    assert_eq!(session.pending_len(), 0);

    let payload = session.codec().encode(&70u32).unwrap();
    send_frame(&peer, HubFrame::Response { correlation_id, payload }).await;

    // the session keeps working after the stale completion
    let next = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<u32, u32>(ECHO, &8).await })
    };
    let (correlation_id, _) = next_request(&peer).await;
    let payload = session.codec().encode(&80u32).unwrap();
    send_frame(&peer, HubFrame::Response { correlation_id, payload }).await;
    assert_eq!(next.await.unwrap().unwrap(), 80);
}

#[tokio::test]
async fn test_cancel_future_resolves_call_locally() {
    let (session, peer) = scripted(SessionConfig::standard());
    let payload = session.codec().encode(&1u32).unwrap();
    let reply = session.invoke(ECHO, payload, CallMode::Awaited).await.unwrap();
    next_request(&peer).await;

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    let waiter = tokio::spawn(reply.wait_or_cancel(async move {
        let _ = cancel_rx.await;
    }));
    cancel_tx.send(()).unwrap();

    let result = waiter.await.unwrap();
    assert_eq!(result.unwrap_err(), Error::Fault(Fault::cancelled()));
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn test_remote_fault_reaches_caller() {
    let (session, peer) = scripted(SessionConfig::standard());
    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<u32, u32>(ECHO, &1).await })
    };
    let (correlation_id, _) = next_request(&peer).await;

    let fault = Fault::new(Status::PermissionDenied, "not yours");
    send_frame(&peer, HubFrame::Fault { correlation_id, fault: fault.clone() }).await;

    assert_eq!(call.await.unwrap().unwrap_err(), Error::Fault(fault));
}

#[tokio::test]
async fn test_too_many_pending_calls_are_refused() {
    let (session, peer) = scripted(SessionConfig::standard().with_max_pending(2));

    let held: Vec<_> = (0..2u32)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.call::<u32, u32>(ECHO, &i).await })
        })
        .collect();
    for _ in 0..2 {
        next_request(&peer).await;
    }

    let refused = session.call::<u32, u32>(ECHO, &3).await;
    assert!(is_status(&refused, Status::ResourceExhausted));
    assert_eq!(session.pending_len(), 2);

    for call in held {
        call.abort();
    }
}

#[tokio::test]
async fn test_undecodable_frame_closes_session() {
    let (session, peer) = scripted(SessionConfig::standard());
    peer.send(&[0xff, 0xff, 0xff]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), session.closed()).await.unwrap();
    assert_eq!(
        next_frame(&peer).await,
        HubFrame::Close {
            reason: Some("protocol error".into())
        }
    );
}

#[tokio::test]
async fn test_hub_session_serves_requests_by_method_id() {
    let hub = HubBuilder::new("Chat")
        .method(MethodId(10), "Shout", |_session: DuplexSession, text: String| async move {
            Ok(text.to_uppercase())
        })
        .build(&TypeRegistry::new())
        .unwrap();

    let (local, peer) = ChannelTransport::pair();
    let session = hub.open_session(Arc::new(local), Codec::text());
    let codec = Codec::text();

    send_frame(
        &peer,
        HubFrame::Request {
            method_id: MethodId(10),
            correlation_id: Some(1),
            payload: codec.encode(&"hey").unwrap(),
        },
    )
    .await;
    send_frame(
        &peer,
        HubFrame::Request {
            method_id: MethodId(11),
            correlation_id: Some(2),
            payload: codec.encode(&"hey").unwrap(),
        },
    )
    .await;

    let mut frames = vec![next_frame(&peer).await, next_frame(&peer).await];
    frames.sort_by_key(|f| f.completes());

    match &frames[0] {
        HubFrame::Response { correlation_id: 1, payload } => {
            assert_eq!(codec.decode::<String>(payload).unwrap(), "HEY");
        }
        other => panic!("expected a response, got {:?}", other),
    }
    match &frames[1] {
        HubFrame::Fault { correlation_id: 2, fault } => assert_eq!(fault.status, Status::Unimplemented),
        other => panic!("expected a fault, got {:?}", other),
    }

    session.close().await;
}

#[tokio::test]
async fn test_dropped_call_future_abandons_its_entry() {
    let (session, peer) = scripted(SessionConfig::standard());

    let timed = tokio::time::timeout(Duration::from_millis(20), session.call::<u32, u32>(ECHO, &1)).await;
    assert!(timed.is_err());
    next_request(&peer).await;
    assert_eq!(session.pending_len(), 0);

    // a wait dropped inside `select!` is abandoned the same way
    let payload = session.codec().encode(&2u32).unwrap();
    let reply = session.invoke(ECHO, payload, CallMode::Awaited).await.unwrap();
    tokio::select! {
        _ = reply.wait() => panic!("nobody answered"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
    }
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn test_slow_push_handler_does_not_stall_responses() {
    let (session, peer) = scripted(SessionConfig::standard());
    let stuck = Arc::new(Notify::new());
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    {
        let stuck = stuck.clone();
        session.on_push(MethodId(42), move |_: String| {
            let stuck = stuck.clone();
            let entered = entered_tx.clone();
            async move {
                let _ = entered.send(());
                stuck.notified().await;
            }
        });
    }

    let codec = session.codec();
    send_frame(
        &peer,
        HubFrame::Push {
            method_id: MethodId(42),
            payload: codec.encode(&"hold on").unwrap(),
        },
    )
    .await;
    tokio::time::timeout(Duration::from_secs(1), entered_rx.recv()).await.unwrap();

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<u32, u32>(ECHO, &3).await })
    };
    let (correlation_id, _) = next_request(&peer).await;
    let payload = codec.encode(&30u32).unwrap();
    send_frame(&peer, HubFrame::Response { correlation_id, payload }).await;

    let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap();
    assert_eq!(result.unwrap().unwrap(), 30);
    stuck.notify_waiters();
}

#[tokio::test]
async fn test_slow_hub_method_does_not_stall_other_requests() {
    let stuck = Arc::new(Notify::new());
    let hub = {
        let stuck = stuck.clone();
        HubBuilder::new("Chat")
            .method(MethodId(10), "Shout", |_session: DuplexSession, text: String| async move {
                Ok(text.to_uppercase())
            })
            .method(MethodId(20), "Stall", move |_session: DuplexSession, _: String| {
                let stuck = stuck.clone();
                async move {
                    stuck.notified().await;
                    Ok(String::new())
                }
            })
            .build(&TypeRegistry::new())
            .unwrap()
    };

    let (local, peer) = ChannelTransport::pair();
    let _session = hub.open_session(Arc::new(local), Codec::text());
    let codec = Codec::text();

    for (method_id, correlation_id) in [(MethodId(20), 1), (MethodId(10), 2)] {
        send_frame(
            &peer,
            HubFrame::Request {
                method_id,
                correlation_id: Some(correlation_id),
                payload: codec.encode(&"hey").unwrap(),
            },
        )
        .await;
    }

    match next_frame(&peer).await {
        HubFrame::Response { correlation_id: 2, payload } => {
            assert_eq!(codec.decode::<String>(&payload).unwrap(), "HEY");
        }
        other => panic!("expected the second request's response, got {:?}", other),
    }
    stuck.notify_waiters();
}

#[tokio::test]
async fn test_connect_hook_pushes_before_requests_are_served() {
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let go_rx = Arc::new(tokio::sync::Mutex::new(Some(go_rx)));
    let hub = HubBuilder::new("Chat")
        .method(MethodId(10), "Shout", |_session: DuplexSession, text: String| async move {
            Ok(text.to_uppercase())
        })
        .on_connect(move |session| {
            let go_rx = go_rx.clone();
            async move {
                if let Some(go) = go_rx.lock().await.take() {
                    let _ = go.await;
                }
                session.push(MethodId(5), &"welcome").await.unwrap();
            }
        })
        .build(&TypeRegistry::new())
        .unwrap();

    let (local, peer) = ChannelTransport::pair();
    let session = hub.open_session(Arc::new(local), Codec::text());
    assert_eq!(session.state(), SessionState::Open);
    let codec = Codec::text();

    send_frame(
        &peer,
        HubFrame::Request {
            method_id: MethodId(10),
            correlation_id: Some(1),
            payload: codec.encode(&"hey").unwrap(),
        },
    )
    .await;
    go_tx.send(()).unwrap();

    assert_eq!(
        next_frame(&peer).await,
        HubFrame::Push {
            method_id: MethodId(5),
            payload: codec.encode(&"welcome").unwrap(),
        }
    );
    match next_frame(&peer).await {
        HubFrame::Response { correlation_id: 1, payload } => {
            assert_eq!(codec.decode::<String>(&payload).unwrap(), "HEY");
        }
        other => panic!("expected a response, got {:?}", other),
    }

    session.close().await;
}

#[tokio::test]
async fn test_panicking_connect_hook_closes_the_session() {
    let hub = HubBuilder::new("Chat")
        .method(MethodId(10), "Shout", |_session: DuplexSession, text: String| async move {
            Ok(text.to_uppercase())
        })
        .on_connect(|_session| async move {
            panic!("hook failed on purpose");
        })
        .build(&TypeRegistry::new())
        .unwrap();

    let (local, peer) = ChannelTransport::pair();
    let session = hub.open_session(Arc::new(local), Codec::text());

    tokio::time::timeout(Duration::from_secs(1), session.closed()).await.unwrap();
    assert_eq!(
        next_frame(&peer).await,
        HubFrame::Close {
            reason: Some("connect hook failed".into())
        }
    );
}

#[tokio::test]
async fn test_closed_session_cannot_join_a_group() {
    let (session, _peer) = scripted(SessionConfig::standard());
    let groups = Groups::default();
    let lobby = groups.group("lobby");

    session.close().await;
    assert!(!lobby.add(&session));
    assert!(lobby.is_empty());

    let (open, _other) = scripted(SessionConfig::standard());
    assert!(lobby.add(&open));
    assert!(lobby.contains(open.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_exceed_max_pending() {
    let (session, _peer) = scripted(SessionConfig::standard().with_max_pending(4));
    let start = Arc::new(Barrier::new(32));

    let attempts: Vec<_> = (0..32u32)
        .map(|i| {
            let session = session.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                let payload = session.codec().encode(&i).unwrap();
                session.invoke(ECHO, payload, CallMode::Awaited).await
            })
        })
        .collect();

    let mut held = Vec::new();
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(reply) => held.push(reply),
            Err(e) => assert_eq!(e.fault().map(|f| f.status), Some(Status::ResourceExhausted)),
        }
    }
    assert!(held.len() <= 4, "{} calls admitted", held.len());
    assert_eq!(session.pending_len(), held.len());
}
