use bytes::Bytes;
use rstest::{fixture, rstest};

use super::*;
use crate::protocol::{ReceiverSettleMode, Role, SenderSettleMode};
use crate::service::setup_local_tracing;

#[fixture]
fn setup() {
    // another test may have installed the subscriber already
    let _ = setup_local_tracing();
}

struct RecordingSink {
    state: ConnectionState,
    max_frame_size: u32,
    frames: Vec<(u16, Performative)>,
}

impl RecordingSink {
    fn new() -> RecordingSink {
        RecordingSink {
            state: ConnectionState::Opened,
            max_frame_size: 64 * 1024,
            frames: Vec::new(),
        }
    }

    fn take(&mut self) -> Vec<(u16, Performative)> {
        std::mem::take(&mut self.frames)
    }

    fn session_flows(&self) -> usize {
        self.frames
            .iter()
            .filter(|(_, frame)| matches!(frame, Performative::Flow(flow) if flow.handle.is_none()))
            .count()
    }
}

impl FrameSink for RecordingSink {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    async fn process_outgoing_frame(&mut self, channel: u16, frame: Performative) -> AppResult<()> {
        self.frames.push((channel, frame));
        Ok(())
    }
}

fn new_session(config: SessionConfig) -> Session {
    Session::new(0, &config, LinkConfig::default())
}

fn peer_begin(incoming_window: u32) -> Begin {
    Begin {
        remote_channel: Some(0),
        next_outgoing_id: 0,
        incoming_window,
        outgoing_window: 100,
        ..Default::default()
    }
}

async fn mapped_session(sink: &mut RecordingSink, config: SessionConfig, peer_window: u32) -> Session {
    let mut session = new_session(config);
    session.begin(sink, WaitMode::NoWait).await.unwrap();
    session
        .incoming_frame(sink, 5, Performative::Begin(peer_begin(peer_window)))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Mapped);
    sink.take();
    session
}

fn peer_attach(name: &str, handle: u32, role: Role) -> Attach {
    Attach {
        name: name.to_string(),
        handle,
        role,
        snd_settle_mode: Some(SenderSettleMode::Mixed),
        rcv_settle_mode: Some(ReceiverSettleMode::First),
        source: Some(Source::new("source")),
        target: Some(Target::new("target")),
        unsettled: None,
        incomplete_unsettled: false,
        initial_delivery_count: match role {
            Role::Sender => Some(0),
            Role::Receiver => None,
        },
        max_message_size: None,
        offered_capabilities: None,
        desired_capabilities: None,
        properties: None,
    }
}

/// An attached sender link with `credit` granted by the peer on handle 9.
async fn attached_sender(sink: &mut RecordingSink, session: &mut Session, credit: u32) -> String {
    let name = session.create_sender_link("queue", None).unwrap();
    session.attach_link(sink, &name).await.unwrap();
    session
        .incoming_frame(
            sink,
            5,
            Performative::Attach(peer_attach(&name, 9, Role::Receiver)),
        )
        .await
        .unwrap();
    session
        .incoming_frame(
            sink,
            5,
            Performative::Flow(Flow {
                next_incoming_id: Some(session.next_outgoing_id()),
                incoming_window: 100,
                next_outgoing_id: 0,
                outgoing_window: 100,
                handle: Some(9),
                delivery_count: Some(0),
                link_credit: Some(credit),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    sink.take();
    name
}

#[tokio::test]
async fn test_peer_begins_on_channel_three() {
    let mut sink = RecordingSink::new();
    let begin = Begin {
        remote_channel: None,
        next_outgoing_id: 5,
        incoming_window: 10,
        outgoing_window: 20,
        handle_max: 10,
        ..Default::default()
    };
    let session = Session::from_incoming_frame(
        &mut sink,
        0,
        3,
        begin,
        &SessionConfig::default(),
        LinkConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(session.state(), SessionState::Mapped);
    assert_eq!(session.remote_channel(), Some(3));
    assert_eq!(session.next_incoming_id(), Some(5));
    assert_eq!(session.remote_incoming_window(), 10);
    assert_eq!(session.remote_outgoing_window(), 20);
    assert_eq!(session.handle_max(), 10);

    let frames = sink.take();
    assert_eq!(frames.len(), 1);
    let (channel, Performative::Begin(reply)) = &frames[0] else {
        panic!("expected a begin reply, got {:?}", frames[0]);
    };
    assert_eq!(*channel, 0);
    assert_eq!(reply.remote_channel, Some(3));
}

#[tokio::test]
async fn test_begin_sent_then_mapped() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig::default());
    let mut states = session.subscribe_state();

    session.begin(&mut sink, WaitMode::Forever).await.unwrap();
    assert_eq!(session.state(), SessionState::BeginSent);
    assert_eq!(*states.borrow_and_update(), SessionState::BeginSent);
    let frames = sink.take();
    assert!(matches!(&frames[..], [(0, Performative::Begin(begin))] if begin.remote_channel.is_none()));

    session
        .incoming_frame(&mut sink, 5, Performative::Begin(peer_begin(50)))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Mapped);
    assert_eq!(session.remote_channel(), Some(5));
    assert_eq!(*states.borrow_and_update(), SessionState::Mapped);
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_begin_twice_is_rejected() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig::default());
    session.begin(&mut sink, WaitMode::NoWait).await.unwrap();
    let result = session.begin(&mut sink, WaitMode::NoWait).await;
    assert!(matches!(result, Err(AppError::IllegalStateError(_))));
}

#[tokio::test]
async fn test_pipelined_open_policy() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig {
        allow_pipelined_open: false,
        ..Default::default()
    });
    let result = session.begin(&mut sink, WaitMode::NoWait).await;
    assert!(matches!(result, Err(AppError::PolicyViolation(_))));
    assert_eq!(session.state(), SessionState::Unmapped);
    assert!(sink.frames.is_empty());

    session
        .begin(&mut sink, WaitMode::Timeout(std::time::Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::BeginSent);
}

#[rstest]
#[case(2, 1)]
#[case(4, 3)]
#[case(8, 7)]
fn test_handle_allocation_bounded(#[case] handle_max: u32, #[case] usable: u32) {
    let mut session = new_session(SessionConfig {
        handle_max,
        ..Default::default()
    });
    for expected in 1..=usable {
        let name = session.create_sender_link("queue", None).unwrap();
        assert_eq!(session.output_handle(expected), Some(name.as_str()));
    }
    let result = session.create_receiver_link("queue", None);
    assert!(matches!(result, Err(AppError::HandleExhausted(max)) if max == handle_max));
}

#[tokio::test]
async fn test_released_handle_is_reused() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig::default());
    let first = session.create_sender_link("a", None).unwrap();
    let second = session.create_sender_link("b", None).unwrap();
    let third = session.create_receiver_link("c", None).unwrap();
    assert_eq!(session.output_handle(2), Some(second.as_str()));

    // never attached, released at once
    session
        .detach_link(&mut sink, &second, true, None)
        .await
        .unwrap();
    assert!(session.link(&second).is_none());
    assert_eq!(session.output_handle(2), None);

    let fourth = session.create_sender_link("d", None).unwrap();
    assert_eq!(session.output_handle(1), Some(first.as_str()));
    assert_eq!(session.output_handle(2), Some(fourth.as_str()));
    assert_eq!(session.output_handle(3), Some(third.as_str()));
}

#[tokio::test]
async fn test_transfer_requires_mapped_session() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig::default());
    let result = session
        .outgoing_transfer(&mut sink, Transfer::default())
        .await
        .unwrap();
    assert_eq!(result.outcome, TransferState::Error);
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_transfer_busy_without_window() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 0).await;
    let result = session
        .outgoing_transfer(
            &mut sink,
            Transfer {
                payload: Bytes::from_static(b"hello"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, TransferResult::busy());
    assert_eq!(session.next_outgoing_id(), 0);
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_transfer_consumes_window() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 2).await;
    let outgoing_window = session.outgoing_window();

    for expected in 0..2u32 {
        let result = session
            .outgoing_transfer(
                &mut sink,
                Transfer {
                    payload: Bytes::from_static(b"hello"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result, TransferResult::okay(expected));
    }
    assert_eq!(session.next_outgoing_id(), 2);
    assert_eq!(session.remote_incoming_window(), 0);
    assert_eq!(session.outgoing_window(), outgoing_window - 2);
    assert_eq!(sink.frames.len(), 2);

    let result = session
        .outgoing_transfer(&mut sink, Transfer::default())
        .await
        .unwrap();
    assert_eq!(result.outcome, TransferState::Busy);
}

#[tokio::test]
async fn test_large_transfer_is_split() {
    let mut sink = RecordingSink::new();
    sink.max_frame_size = 512;
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 100).await;
    let payload = Bytes::from(vec![7u8; 2000]);

    let result = session
        .outgoing_transfer(
            &mut sink,
            Transfer {
                handle: 1,
                delivery_tag: Some(Bytes::from_static(b"tag")),
                payload: payload.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, TransferResult::okay(0));

    let transfers: Vec<Transfer> = sink
        .take()
        .into_iter()
        .map(|(_, frame)| match frame {
            Performative::Transfer(transfer) => transfer,
            other => panic!("unexpected frame {:?}", other),
        })
        .collect();
    assert!(transfers.len() > 1);
    assert_eq!(transfers[0].delivery_id, Some(0));
    assert_eq!(transfers[0].delivery_tag, Some(Bytes::from_static(b"tag")));
    for transfer in &transfers[1..] {
        assert_eq!(transfer.delivery_id, None);
        assert_eq!(transfer.delivery_tag, None);
        assert_eq!(transfer.handle, 1);
    }
    let (last, rest) = transfers.split_last().unwrap();
    assert!(rest.iter().all(|t| t.more));
    assert!(!last.more);
    for transfer in &transfers {
        let frame = Performative::Transfer(transfer.clone());
        assert!(encoded_frame_size(&frame) <= 512);
    }
    let joined: Vec<u8> = transfers
        .iter()
        .flat_map(|t| t.payload.iter().copied())
        .collect();
    assert_eq!(joined, payload.to_vec());
    assert_eq!(session.next_outgoing_id(), transfers.len() as u32);
    assert_eq!(session.remote_incoming_window(), 100 - transfers.len() as i64);
}

#[tokio::test]
async fn test_split_transfer_needs_whole_window() {
    let mut sink = RecordingSink::new();
    sink.max_frame_size = 512;
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 2).await;
    let result = session
        .outgoing_transfer(
            &mut sink,
            Transfer {
                payload: Bytes::from(vec![0u8; 4000]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, TransferState::Busy);
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_incoming_window_replenished_once() {
    let mut sink = RecordingSink::new();
    let config = SessionConfig {
        incoming_window: 2,
        ..Default::default()
    };
    let mut session = mapped_session(&mut sink, config, 100).await;
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Attach(peer_attach("inbound", 4, Role::Sender)),
        )
        .await
        .unwrap();
    sink.take();

    for delivery_id in 0..2u32 {
        session
            .incoming_frame(
                &mut sink,
                5,
                Performative::Transfer(Transfer {
                    handle: 4,
                    delivery_id: Some(delivery_id),
                    delivery_tag: Some(Bytes::from(delivery_id.to_be_bytes().to_vec())),
                    settled: Some(true),
                    payload: Bytes::from_static(b"body"),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
    }

    assert_eq!(sink.session_flows(), 1);
    assert_eq!(session.incoming_window(), 2);
    assert_eq!(session.next_incoming_id(), Some(2));
    let flow = sink
        .frames
        .iter()
        .find_map(|(_, frame)| match frame {
            Performative::Flow(flow) if flow.handle.is_none() => Some(flow.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(flow.incoming_window, 2);
    assert_eq!(flow.next_incoming_id, Some(2));

    let link_name = session.input_handle(4).unwrap().to_string();
    assert_eq!(session.receive(&link_name).unwrap().unwrap().delivery_id, 0);
    assert_eq!(session.receive(&link_name).unwrap().unwrap().delivery_id, 1);
    assert!(session.receive(&link_name).unwrap().is_none());
}

#[tokio::test]
async fn test_flow_recomputes_remote_window() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    for _ in 0..2 {
        session
            .outgoing_transfer(&mut sink, Transfer::default())
            .await
            .unwrap();
    }
    assert_eq!(session.remote_incoming_window(), 8);

    // the peer has only seen transfer 0
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Flow(Flow {
                next_incoming_id: Some(1),
                incoming_window: 10,
                next_outgoing_id: 4,
                outgoing_window: 3,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(session.remote_incoming_window(), 9);
    assert_eq!(session.remote_outgoing_window(), 3);
    assert_eq!(session.next_incoming_id(), Some(4));

    // before the peer has seen any begin of ours
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Flow(Flow {
                next_incoming_id: None,
                incoming_window: 6,
                next_outgoing_id: 4,
                outgoing_window: 3,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(session.remote_incoming_window(), 6);
}

#[tokio::test]
async fn test_session_flow_reaches_links() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 0).await;
    let handle = session.link(&name).unwrap().handle();

    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Flow(Flow {
                next_incoming_id: Some(0),
                incoming_window: 10,
                next_outgoing_id: 0,
                outgoing_window: 10,
                echo: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let frames = sink.take();
    assert_eq!(frames.len(), 1);
    let (_, Performative::Flow(echo)) = &frames[0] else {
        panic!("expected an echoed flow, got {:?}", frames[0]);
    };
    assert_eq!(echo.handle, Some(handle));
    // session fields are filled in by the session
    assert_eq!(echo.incoming_window, session.incoming_window());
    assert_eq!(echo.next_outgoing_id, session.next_outgoing_id());
}

#[tokio::test]
async fn test_send_on_sender_link() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 1).await;

    let result = session
        .send(&mut sink, &name, Bytes::from_static(b"one"), false)
        .await
        .unwrap();
    assert_eq!(result, TransferResult::okay(0));
    let sender = session.link(&name).and_then(Link::as_sender).unwrap();
    assert_eq!(sender.link_credit(), 0);
    assert_eq!(sender.unsettled_count(), 1);

    // out of link credit
    let result = session
        .send(&mut sink, &name, Bytes::from_static(b"two"), false)
        .await
        .unwrap();
    assert_eq!(result.outcome, TransferState::Busy);
    assert_eq!(sink.frames.len(), 1);
}

#[tokio::test]
async fn test_delivery_outcome_is_drained() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 5).await;

    for (payload, settled) in [(&b"one"[..], false), (&b"two"[..], true)] {
        session
            .send(&mut sink, &name, Bytes::copy_from_slice(payload), settled)
            .await
            .unwrap();
    }
    assert_eq!(session.take_outcome(&name, 0).unwrap(), None);

    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first: 0,
                last: None,
                settled: true,
                state: Some(DeliveryState::Accepted),
                batchable: false,
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        session.take_outcome(&name, 0).unwrap(),
        Some(DeliveryOutcome::Settled(Some(DeliveryState::Accepted)))
    );
    assert_eq!(session.take_outcome(&name, 0).unwrap(), None);
    // the pre-settled delivery never had an outcome
    assert_eq!(session.take_outcome(&name, 1).unwrap(), None);
    assert!(matches!(
        session.take_outcome("missing", 0),
        Err(AppError::UnknownLink(_))
    ));
}

#[tokio::test]
async fn test_incoming_attach_mirrors_role() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Attach(peer_attach("from-peer", 12, Role::Sender)),
        )
        .await
        .unwrap();

    let link = session.link("from-peer").unwrap();
    assert_eq!(link.role(), Role::Receiver);
    assert_eq!(link.state(), LinkState::Attached);
    assert_eq!(link.remote_handle(), Some(12));
    assert_eq!(session.input_handle(12), Some("from-peer"));
    assert_eq!(session.output_handle(link.handle()), Some("from-peer"));

    let frames = sink.take();
    let Some((_, Performative::Attach(reply))) = frames.first() else {
        panic!("expected an attach reply, got {:?}", frames);
    };
    assert_eq!(reply.role, Role::Receiver);
    assert_eq!(reply.name, "from-peer");
    // the receiver grants its prefetch right away
    assert!(frames
        .iter()
        .any(|(_, frame)| matches!(frame, Performative::Flow(flow) if flow.link_credit == Some(300))));
}

#[rstest]
#[tokio::test]
async fn test_handle_exhaustion_on_incoming_attach(_setup: ()) {
    let mut sink = RecordingSink::new();
    let config = SessionConfig {
        handle_max: 2,
        ..Default::default()
    };
    let mut session = new_session(config);
    session.begin(&mut sink, WaitMode::NoWait).await.unwrap();
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Begin(Begin {
                handle_max: 2,
                ..peer_begin(10)
            }),
        )
        .await
        .unwrap();
    session.create_sender_link("queue", None).unwrap();
    sink.take();

    let result = session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Attach(peer_attach("one-too-many", 0, Role::Sender)),
        )
        .await;
    assert!(matches!(result, Err(AppError::HandleExhausted(2))));
    assert!(session.link("one-too-many").is_none());
    assert_eq!(session.state(), SessionState::Mapped);
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_peer_detach_tears_down_link() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 5).await;
    let handle = session.link(&name).unwrap().handle();

    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Detach(Detach {
                handle: 9,
                closed: true,
                error: None,
            }),
        )
        .await
        .unwrap();

    let frames = sink.take();
    assert!(matches!(
        &frames[..],
        [(0, Performative::Detach(reply))] if reply.handle == handle && reply.closed
    ));
    assert!(session.link(&name).is_none());
    assert_eq!(session.input_handle(9), None);
    assert_eq!(session.output_handle(handle), None);
}

#[tokio::test]
async fn test_local_detach_completes_on_reply() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 5).await;

    session
        .detach_link(&mut sink, &name, true, None)
        .await
        .unwrap();
    assert_eq!(
        session.link(&name).map(LinkEndpoint::state),
        Some(LinkState::DetachSent)
    );
    session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Detach(Detach {
                handle: 9,
                closed: true,
                error: None,
            }),
        )
        .await
        .unwrap();
    assert!(session.link(&name).is_none());
}

#[tokio::test]
async fn test_peer_end_tears_down_session() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    attached_sender(&mut sink, &mut session, 5).await;

    session
        .incoming_frame(&mut sink, 5, Performative::End(End::default()))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Unmapped);
    assert_eq!(session.link_names().count(), 0);
    let frames = sink.take();
    assert!(matches!(&frames[..], [(0, Performative::End(End { error: None }))]));
}

#[tokio::test]
async fn test_local_end_waits_for_peer() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    session.end(&mut sink, None).await.unwrap();
    assert_eq!(session.state(), SessionState::EndSent);

    session
        .incoming_frame(&mut sink, 5, Performative::End(End::default()))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Unmapped);
    // only our own end went out
    assert_eq!(sink.frames.len(), 1);
}

#[tokio::test]
async fn test_end_with_error_discards() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let error = AmqpError::new(condition::INTERNAL_ERROR, "giving up");
    session.end(&mut sink, Some(error.clone())).await.unwrap();
    assert_eq!(session.state(), SessionState::Discarding);
    assert!(matches!(
        &sink.frames[..],
        [(0, Performative::End(End { error: Some(sent) }))] if *sent == error
    ));

    // nothing more to end
    session.end(&mut sink, None).await.unwrap();
    assert_eq!(sink.frames.len(), 1);
}

#[rstest]
#[case::transfer(Performative::Transfer(Transfer { handle: 42, delivery_id: Some(0), ..Default::default() }))]
#[case::flow(Performative::Flow(Flow { handle: Some(42), ..Default::default() }))]
#[case::detach(Performative::Detach(Detach { handle: 42, closed: true, error: None }))]
#[tokio::test]
async fn test_unattached_handle_ends_session(_setup: (), #[case] frame: Performative) {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;

    let result = session.incoming_frame(&mut sink, 5, frame).await;
    assert!(matches!(result, Err(AppError::UnattachedHandle(42))));
    assert_eq!(session.state(), SessionState::Discarding);
    let frames = sink.take();
    let [(0, Performative::End(End { error: Some(error) }))] = &frames[..] else {
        panic!("expected an end with an error, got {:?}", frames);
    };
    assert_eq!(error.condition, condition::UNATTACHED_HANDLE);
}

#[rstest]
#[case::new_link(false)]
#[case::local_link(true)]
#[tokio::test]
async fn test_attach_on_used_handle_ends_session(_setup: (), #[case] local: bool) {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let holder = attached_sender(&mut sink, &mut session, 5).await;
    let name = if local {
        let name = session.create_sender_link("other", None).unwrap();
        session.attach_link(&mut sink, &name).await.unwrap();
        sink.take();
        name
    } else {
        "from-peer".to_string()
    };

    let result = session
        .incoming_frame(
            &mut sink,
            5,
            Performative::Attach(peer_attach(&name, 9, Role::Receiver)),
        )
        .await;
    assert!(matches!(result, Err(AppError::HandleInUse(9))));
    assert_eq!(session.state(), SessionState::Discarding);
    assert_eq!(session.input_handle(9), Some(holder.as_str()));
    let frames = sink.take();
    let [(0, Performative::End(End { error: Some(error) }))] = &frames[..] else {
        panic!("expected an end with an error, got {:?}", frames);
    };
    assert_eq!(error.condition, condition::HANDLE_IN_USE);
}

#[tokio::test]
async fn test_closing_connection_discards_session() {
    let mut sink = RecordingSink::new();
    let mut session = mapped_session(&mut sink, SessionConfig::default(), 10).await;
    let name = attached_sender(&mut sink, &mut session, 5).await;

    sink.state = ConnectionState::CloseRcvd;
    session.on_connection_state_change(&mut sink).await.unwrap();
    assert_eq!(session.state(), SessionState::Discarding);
    assert_eq!(
        session.link(&name).map(LinkEndpoint::state),
        Some(LinkState::Detached)
    );
    assert!(sink.frames.is_empty());
}

#[tokio::test]
async fn test_links_attach_when_session_maps() {
    let mut sink = RecordingSink::new();
    let mut session = new_session(SessionConfig::default());
    let name = session.create_receiver_link("inbox", None).unwrap();
    session.begin(&mut sink, WaitMode::NoWait).await.unwrap();
    sink.take();

    session
        .incoming_frame(&mut sink, 5, Performative::Begin(peer_begin(10)))
        .await
        .unwrap();
    let frames = sink.take();
    assert!(matches!(
        &frames[..],
        [(0, Performative::Attach(attach))] if attach.name == name && attach.role == Role::Receiver
    ));
    assert_eq!(
        session.link(&name).map(LinkEndpoint::state),
        Some(LinkState::AttachSent)
    );
}
