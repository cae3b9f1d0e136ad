mod common;

use std::time::Duration;

use common::*;
use peerwire::engine::{EngineError, Event};
use peerwire::message::PeerMessage;
use peerwire::peer::PeerKey;
use peerwire::piece::{piece_hash, BlockInfo, BlockKey, BLOCK_SIZE};
use peerwire::transport::{ConnId, TransportError};
use tokio::time::advance;
use tokio_util::bytes::Bytes;
use tracing_test::traced_test;

const BLOCK: usize = BLOCK_SIZE as usize;

fn waiting(engine: &TestEngine, index: u32) -> Vec<BlockKey> {
    engine.piece(index).unwrap().waiting().collect()
}

fn waiting_offsets(engine: &TestEngine, index: u32) -> Vec<u32> {
    waiting(engine, index)
        .into_iter()
        .map(|key| engine.store().block(key).unwrap().info().offset)
        .collect()
}

/// A running peer that has every piece and has unchoked us.
fn unchoked_seeder(engine: &mut TestEngine, n: u8) -> (PeerKey, ConnId) {
    let (key, conn) = running_peer(engine, n, true);
    feed(engine, conn, &[PeerMessage::HaveAll, PeerMessage::Unchoke]);
    engine.transport_mut().take_bytes(conn);
    engine.take_events();
    (key, conn)
}

#[test]
fn interest_follows_have() {
    let mut engine = engine(4);
    engine.activate_piece(0, 1000, None).unwrap();
    let (key, conn) = running_peer(&mut engine, 1, true);

    let flow = engine.peer(key).unwrap().session().unwrap().flow();
    assert!(!flow.am_interested);

    feed(&mut engine, conn, &[PeerMessage::Have(0), PeerMessage::Have(0)]);
    assert_eq!(engine.peer(key).unwrap().pieces_have(), 1);
    assert!(engine.peer(key).unwrap().session().unwrap().flow().am_interested);
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Interested]
    );

    // A piece the peer lacks changes nothing
    feed(&mut engine, conn, &[PeerMessage::Have(3)]);
    assert!(engine.transport_mut().take_messages(conn).is_empty());

    // Losing the last wanted piece withdraws interest
    engine.deactivate_piece(0);
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::NotInterested]
    );
}

#[test]
fn request_layout_and_depth() {
    let mut engine = engine(2);
    engine.activate_piece(0, BLOCK_SIZE * 3, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);

    let blocks = waiting(&engine, 0);
    let requests: Vec<_> = blocks
        .iter()
        .map(|block| engine.send_request(key, *block).unwrap())
        .collect();

    let depths: Vec<usize> = requests
        .iter()
        .map(|r| engine.request(*r).unwrap().qdepth())
        .collect();
    assert_eq!(depths, vec![0, 1, 2]);
    assert_eq!(engine.peer(key).unwrap().active_requests(), 3);
    assert_eq!(engine.peer(key).unwrap().stats().requests_sent, 3);
    assert!(waiting(&engine, 0).is_empty());
    assert_eq!(engine.piece(0).unwrap().sent().len(), 3);

    assert_eq!(
        engine.transport_mut().take_messages(conn),
        (0..3)
            .map(|i| PeerMessage::Request {
                index: 0,
                begin: i * BLOCK_SIZE,
                length: BLOCK_SIZE,
            })
            .collect::<Vec<_>>()
    );
}

#[test]
fn send_request_needs_running_peer() {
    let mut engine = engine(2);
    engine.activate_piece(0, 100, None).unwrap();
    let block = waiting(&engine, 0)[0];
    let key = engine.add_peer(addr(1));
    assert_eq!(
        engine.send_request(key, block),
        Err(EngineError::PeerNotRunning(key))
    );
    assert_eq!(waiting(&engine, 0), vec![block]);
}

#[tokio::test(start_paused = true)]
async fn per_depth_delays_are_independent() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 3, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);

    for block in waiting(&engine, 0) {
        engine.send_request(key, block).unwrap();
    }
    for i in 0..3u32 {
        advance(Duration::from_millis(10)).await;
        feed(&mut engine, conn, &[piece_msg(0, i * BLOCK_SIZE, BLOCK)]);
    }

    let peer = engine.peer(key).unwrap();
    let rate = peer.rate();
    assert_eq!(rate.depth_delay(0), Some(Duration::from_millis(10)));
    assert_eq!(rate.depth_delay(1), Some(Duration::from_millis(20)));
    assert_eq!(rate.depth_delay(2), Some(Duration::from_millis(30)));
    assert_eq!(rate.depth_delay(3), None);
    // 10, then (10*7+20)/8, then (11.25*7+30)/8
    assert_eq!(rate.block_delay(), Some(Duration::from_nanos(13_593_750)));
    assert_eq!(peer.active_requests(), 0);
    assert_eq!(engine.stats().downloaded, 3 * BLOCK as u64);
}

#[tokio::test(start_paused = true)]
async fn delay_samples_are_clamped() {
    let mut engine = engine(1);
    engine.activate_piece(0, 100, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);

    engine.send_request(key, waiting(&engine, 0)[0]).unwrap();
    advance(Duration::from_secs(200)).await;
    feed(&mut engine, conn, &[piece_msg(0, 0, 100)]);
    assert_eq!(
        engine.peer(key).unwrap().rate().block_delay(),
        Some(Duration::from_secs(60))
    );
}

#[test]
fn pipeline_depth_after_unchoke_and_sample() {
    let mut engine = engine(1);
    engine.activate_piece(0, 100, None).unwrap();
    let (key, conn) = running_peer(&mut engine, 1, true);
    feed(&mut engine, conn, &[PeerMessage::HaveAll, PeerMessage::Unchoke]);
    assert_eq!(engine.peer(key).unwrap().maxq(), 1);

    engine.send_request(key, waiting(&engine, 0)[0]).unwrap();
    feed(&mut engine, conn, &[piece_msg(0, 0, 100)]);
    assert_eq!(engine.peer(key).unwrap().maxq(), 10);

    // Only the unchoke edge resets the depth
    feed(&mut engine, conn, &[PeerMessage::Unchoke]);
    assert_eq!(engine.peer(key).unwrap().maxq(), 10);

    feed(&mut engine, conn, &[PeerMessage::Choke, PeerMessage::Unchoke]);
    assert_eq!(engine.peer(key).unwrap().maxq(), 1);
}

#[test]
fn choke_aborts_all_requests() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 3, None).unwrap();
    let (a, a_conn) = unchoked_seeder(&mut engine, 1);
    let (b, _) = unchoked_seeder(&mut engine, 2);

    let blocks = waiting(&engine, 0);
    for block in &blocks {
        engine.send_request(a, *block).unwrap();
    }
    // End game: b also asks for the middle block
    let shared = engine.send_request(b, blocks[1]).unwrap();
    engine.transport_mut().take_bytes(a_conn);

    feed(&mut engine, a_conn, &[PeerMessage::Choke]);

    let peer = engine.peer(a).unwrap();
    assert_eq!(peer.active_requests(), 0);
    assert!(peer.is_choking_us());
    assert_eq!(engine.unchoked_peers().collect::<Vec<_>>(), vec![b]);
    // No CANCEL goes out for aborted requests
    assert!(engine.transport_mut().take_messages(a_conn).is_empty());

    // Unshared blocks wait again, the shared one still belongs to b only
    assert_eq!(waiting_offsets(&engine, 0), vec![BLOCK_SIZE * 2, 0]);
    assert_eq!(engine.piece(0).unwrap().sent(), &[blocks[1]]);
    assert_eq!(engine.store().block(blocks[1]).unwrap().requests(), &[shared]);
    assert!(engine.take_events().contains(&Event::PeerChokedUs(a)));

    // Choke again is a no-op
    feed(&mut engine, a_conn, &[PeerMessage::Choke]);
    assert!(!engine.take_events().contains(&Event::PeerChokedUs(a)));
}

#[test]
fn duplicate_piece_is_wasted() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 2, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    let block = waiting(&engine, 0)[0];
    engine.send_request(key, block).unwrap();

    let message = piece_msg(0, 0, BLOCK);
    feed(&mut engine, conn, &[message.clone(), message]);

    let received = engine
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, Event::BlockReceived { .. }))
        .count();
    assert_eq!(received, 1);
    assert_eq!(engine.stats().downloaded, BLOCK as u64);
    assert_eq!(engine.stats().wasted, BLOCK as u64);
    assert_eq!(engine.peer(key).unwrap().stats().wasted_blocks, 1);
    assert_eq!(engine.peer(key).unwrap().stats().bytes_received, BLOCK as u64);
    assert_eq!(engine.state_text(key), "Running");
}

#[test]
fn reject_returns_block_and_marks_piece() {
    let mut engine = engine(2);
    engine.activate_piece(1, BLOCK_SIZE * 2, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    let blocks = waiting(&engine, 1);
    engine.send_request(key, blocks[1]).unwrap();

    let reject = PeerMessage::Reject {
        index: 1,
        begin: BLOCK_SIZE,
        length: BLOCK_SIZE,
    };
    feed(&mut engine, conn, &[reject.clone()]);

    let peer = engine.peer(key).unwrap();
    assert_eq!(peer.active_requests(), 0);
    assert!(peer.rejected_piece(1));
    assert!(peer.has_piece(1));
    assert_eq!(waiting(&engine, 1), vec![blocks[1], blocks[0]]);
    assert!(engine.take_events().contains(&Event::RequestRejected {
        peer: key,
        block: BlockInfo::new(1, BLOCK_SIZE, BLOCK_SIZE),
    }));

    // A second reject for the same block matches nothing and is ignored
    feed(&mut engine, conn, &[reject]);
    assert_eq!(engine.state_text(key), "Running");
}

#[test]
fn cancel_withdraws_request() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    let block = waiting(&engine, 0)[0];
    let request = engine.send_request(key, block).unwrap();
    engine.transport_mut().take_bytes(conn);

    engine.cancel(request).unwrap();
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Cancel {
            index: 0,
            begin: 0,
            length: BLOCK_SIZE,
        }]
    );
    assert_eq!(engine.peer(key).unwrap().active_requests(), 0);
    assert_eq!(engine.peer(key).unwrap().stats().cancels_sent, 1);
    assert_eq!(waiting(&engine, 0), vec![block]);
    assert_eq!(engine.cancel(request), Err(EngineError::UnknownRequest(request)));

    // The block raced the cancel on the wire
    feed(&mut engine, conn, &[piece_msg(0, 0, BLOCK)]);
    assert_eq!(engine.stats().wasted, BLOCK as u64);
    assert_eq!(waiting(&engine, 0), vec![block]);
    assert_eq!(engine.state_text(key), "Running");
}

#[test]
fn delivered_block_orphans_other_requests() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 2, None).unwrap();
    let (a, a_conn) = unchoked_seeder(&mut engine, 1);
    let (b, b_conn) = unchoked_seeder(&mut engine, 2);
    let blocks = waiting(&engine, 0);

    engine.send_request(a, blocks[0]).unwrap();
    let slow = engine.send_request(b, blocks[0]).unwrap();
    let other = engine.send_request(b, blocks[1]).unwrap();

    feed(&mut engine, a_conn, &[piece_msg(0, 0, BLOCK)]);
    assert!(engine.request(slow).unwrap().is_orphan());
    assert!(!engine.request(other).unwrap().is_orphan());
    engine.take_events();
    engine.transport_mut().take_bytes(b_conn);

    // b's first sample completes the piece and cancels its orphan
    feed(&mut engine, b_conn, &[piece_msg(0, BLOCK_SIZE, BLOCK)]);
    assert!(engine.request(slow).is_none());
    assert_eq!(engine.peer(b).unwrap().active_requests(), 0);
    assert_eq!(
        engine.transport_mut().take_messages(b_conn),
        vec![
            PeerMessage::NotInterested,
            PeerMessage::Cancel {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            },
        ]
    );
    assert!(engine.take_events().contains(&Event::PieceCompleted(0)));
}

#[test]
fn late_orphan_counts_but_is_not_delivered() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE, None).unwrap();
    let (a, a_conn) = unchoked_seeder(&mut engine, 1);
    let (b, b_conn) = unchoked_seeder(&mut engine, 2);
    let block = waiting(&engine, 0)[0];

    engine.send_request(a, block).unwrap();
    engine.send_request(b, block).unwrap();
    feed(&mut engine, a_conn, &[piece_msg(0, 0, BLOCK)]);
    engine.take_events();

    feed(&mut engine, b_conn, &[piece_msg(0, 0, BLOCK)]);
    assert_eq!(engine.peer(b).unwrap().active_requests(), 0);
    assert_eq!(engine.stats().downloaded, 2 * BLOCK as u64);
    assert_eq!(engine.stats().wasted, 0);
    assert!(!engine
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::BlockReceived { .. })));
}

#[test]
fn wrong_block_length_disconnects() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    engine.send_request(key, waiting(&engine, 0)[0]).unwrap();

    feed(&mut engine, conn, &[piece_msg(0, 0, BLOCK - 1)]);
    assert_eq!(engine.state_text(key), "Disconnected");
    // Aborted on the way out, the block can be fetched elsewhere
    assert_eq!(waiting(&engine, 0).len(), 1);
}

#[test]
fn verified_piece_is_announced() {
    let mut engine = engine(2);
    let data = vec![7u8; 100];
    engine
        .activate_piece(0, 100, Some(piece_hash(&data)))
        .unwrap();
    let (a, a_conn) = unchoked_seeder(&mut engine, 1);
    let (_, b_conn) = running_peer(&mut engine, 2, true);

    engine.send_request(a, waiting(&engine, 0)[0]).unwrap();
    feed(
        &mut engine,
        a_conn,
        &[PeerMessage::Piece {
            index: 0,
            begin: 0,
            block: Bytes::from(data.clone()),
        }],
    );
    assert!(engine.take_events().contains(&Event::PieceCompleted(0)));

    let (input, expected) = engine.verification_input(0).unwrap();
    assert_eq!(input, data);
    assert_eq!(expected, Some(piece_hash(&data)));

    engine.transport_mut().take_bytes(a_conn);
    engine.transport_mut().take_bytes(b_conn);
    engine.on_piece_verified(0, true).unwrap();
    assert!(engine.have().has_piece(0));
    assert!(engine.piece(0).unwrap().hash_ok());
    for conn in [a_conn, b_conn] {
        assert!(engine
            .transport_mut()
            .take_messages(conn)
            .contains(&PeerMessage::Have(0)));
    }
}

#[test]
fn failed_hash_resets_piece() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 2, Some([0; 20])).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    for block in waiting(&engine, 0) {
        engine.send_request(key, block).unwrap();
    }
    feed(
        &mut engine,
        conn,
        &[piece_msg(0, 0, BLOCK), piece_msg(0, BLOCK_SIZE, BLOCK)],
    );
    assert!(engine.piece(0).unwrap().is_complete());

    engine.on_piece_verified(0, false).unwrap();
    let piece = engine.piece(0).unwrap();
    assert!(!piece.is_complete());
    assert!(!piece.hash_ok());
    assert_eq!(waiting_offsets(&engine, 0), vec![0, BLOCK_SIZE]);
    assert!(!engine.have().has_piece(0));
    assert!(engine.take_events().contains(&Event::PieceVerified { index: 0, ok: false }));
}

#[test]
fn verdicts_need_a_complete_unverified_piece() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 2, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);

    // Half the data is still zero filled
    assert_eq!(
        engine.on_piece_verified(0, true),
        Err(EngineError::PieceIncomplete(0))
    );
    assert!(!engine.piece(0).unwrap().hash_ok());
    assert!(!engine.have().has_piece(0));

    for block in waiting(&engine, 0) {
        engine.send_request(key, block).unwrap();
    }
    feed(
        &mut engine,
        conn,
        &[piece_msg(0, 0, BLOCK), piece_msg(0, BLOCK_SIZE, BLOCK)],
    );
    engine.transport_mut().take_bytes(conn);
    engine.take_events();

    engine.on_piece_verified(0, true).unwrap();
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Have(0)]
    );

    // A repeated verdict neither announces again nor resets the data
    assert_eq!(
        engine.on_piece_verified(0, true),
        Err(EngineError::PieceAlreadyVerified(0))
    );
    assert_eq!(
        engine.on_piece_verified(0, false),
        Err(EngineError::PieceAlreadyVerified(0))
    );
    assert!(engine.transport_mut().take_messages(conn).is_empty());
    assert!(engine.piece(0).unwrap().hash_ok());
    assert_eq!(engine.stats().wasted, 0);
    assert_eq!(
        engine.take_events(),
        vec![Event::PieceVerified { index: 0, ok: true }]
    );
}

#[test]
fn serves_verified_data() {
    let mut engine = engine(2);
    let data: Vec<u8> = (0..=255).collect();
    engine.seed_piece(1, &data).unwrap();
    let (key, conn) = running_peer(&mut engine, 1, true);

    feed(
        &mut engine,
        conn,
        &[PeerMessage::Request {
            index: 1,
            begin: 16,
            length: 4,
        }],
    );
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Piece {
            index: 1,
            begin: 16,
            block: Bytes::from_static(&[16, 17, 18, 19]),
        }]
    );
    assert_eq!(engine.stats().uploaded, 4);

    // Missing piece: fast peers get a REJECT
    feed(
        &mut engine,
        conn,
        &[PeerMessage::Request {
            index: 0,
            begin: 0,
            length: 4,
        }],
    );
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Reject {
            index: 0,
            begin: 0,
            length: 4,
        }]
    );

    // Past the end of a piece we hold
    feed(
        &mut engine,
        conn,
        &[PeerMessage::Request {
            index: 1,
            begin: 250,
            length: 16,
        }],
    );
    assert_eq!(engine.state_text(key), "Disconnected");
}

#[test]
fn choke_is_idempotent() {
    let mut engine = engine(1);
    let (key, conn) = running_peer(&mut engine, 1, true);

    engine.choke(key, true).unwrap();
    assert!(engine.transport_mut().take_messages(conn).is_empty());

    engine.choke(key, false).unwrap();
    engine.choke(key, false).unwrap();
    assert_eq!(
        engine.transport_mut().take_messages(conn),
        vec![PeerMessage::Unchoke]
    );
    assert!(!engine.peer(key).unwrap().session().unwrap().flow().am_choking);
}

#[traced_test]
#[test]
fn disconnect_returns_requests() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE * 2, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 1);
    for block in waiting(&engine, 0) {
        engine.send_request(key, block).unwrap();
    }

    engine.on_transport_error(conn, TransportError::Closed);
    assert_eq!(engine.state_text(key), "Disconnected");
    assert_eq!(waiting(&engine, 0).len(), 2);
    assert!(engine.piece(0).unwrap().sent().is_empty());
    assert!(logs_contain("transport error"));
}

#[traced_test]
#[test]
fn records_carry_peer_name_and_key() {
    let mut engine = engine(1);
    engine.activate_piece(0, BLOCK_SIZE, None).unwrap();
    let (key, conn) = unchoked_seeder(&mut engine, 7);
    engine.send_request(key, waiting(&engine, 0)[0]).unwrap();
    feed(
        &mut engine,
        conn,
        &[PeerMessage::Reject {
            index: 0,
            begin: 0,
            length: BLOCK_SIZE,
        }],
    );

    let tag = format!("peer=BT Peer 10.0.0.7:6881 key={key}");
    assert!(logs_contain("rejected"));
    logs_assert(|lines: &[&str]| {
        for event in ["new peer", "handshake complete", "rejected"] {
            if !lines.iter().any(|line| line.contains(event) && line.contains(&tag)) {
                return Err(format!("no {event:?} record tagged {tag:?}"));
            }
        }
        Ok(())
    });
}
