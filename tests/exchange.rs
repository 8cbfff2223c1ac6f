#![expect(missing_docs, reason = "testing")]

use {
    relnet::{
        collab::{ConnectionReset, MessagePool, PacketSink},
        config::Config,
        conn::{Connection, ConnectionEvent, Status},
        lane::{ChannelIndex, DeliveryMethod},
        message::OutgoingMessage,
    },
    std::{
        collections::VecDeque,
        net::{Ipv4Addr, SocketAddr},
        time::{Duration, Instant},
    },
};

const CHANNEL: ChannelIndex = ChannelIndex(0);

#[derive(Default)]
struct Channel {
    packets: VecDeque<Vec<u8>>,
}

impl PacketSink for Channel {
    fn send_packet(&mut self, payload: &[u8], _to: SocketAddr) -> Result<(), ConnectionReset> {
        self.packets.push_back(payload.to_vec());
        Ok(())
    }
}

struct NullPool;

impl MessagePool for NullPool {
    fn recycle(&mut self, _msg: OutgoingMessage) {}
}

struct Peer {
    conn: Connection,
    out: Channel,
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Ticks both peers' heartbeats and delivers any packets produced to the
/// other side, repeating until neither side produces any more traffic or
/// `max_ticks` is reached (whichever comes first).
fn pump(a: &mut Peer, b: &mut Peer, now: &mut Instant, pool: &mut NullPool, tick: Duration, max_ticks: u32) {
    for _ in 0..max_ticks {
        *now += tick;
        a.conn.heartbeat(*now, &mut a.out, pool);
        b.conn.heartbeat(*now, &mut b.out, pool);

        let mut any = false;
        while let Some(packet) = a.out.packets.pop_front() {
            b.conn.on_packet(*now, &packet, pool);
            any = true;
        }
        while let Some(packet) = b.out.packets.pop_front() {
            a.conn.on_packet(*now, &packet, pool);
            any = true;
        }
        if !any {
            break;
        }
    }
}

fn connected_pair(config: Config) -> (Peer, Peer, Instant, NullPool) {
    let now = Instant::now();
    let mut initiator = Peer {
        conn: Connection::connect(addr(1), 1, config.clone(), now),
        out: Channel::default(),
    };
    let mut responder = Peer {
        conn: Connection::accept(addr(2), 2, config, now),
        out: Channel::default(),
    };
    let mut pool = NullPool;
    let mut now = now;
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);

    assert_eq!(Status::Connected, initiator.conn.status());
    assert_eq!(Status::Connected, responder.conn.status());
    (initiator, responder, now, pool)
}

#[test]
fn handshake_completes_on_both_sides() {
    let (initiator, responder, _now, _pool) = connected_pair(Config::default());
    assert!(initiator.conn.events.iter().any(|ev| matches!(ev, ConnectionEvent::Connected)));
    assert!(responder.conn.events.iter().any(|ev| matches!(ev, ConnectionEvent::Connected)));
}

#[test]
fn reliable_message_round_trips() {
    let (mut initiator, mut responder, mut now, mut pool) = connected_pair(Config::default());

    initiator
        .conn
        .send_message(b"hello world".as_slice(), DeliveryMethod::ReliableOrdered, CHANNEL)
        .unwrap();
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);

    assert_eq!(1, responder.conn.recv_msgs.len());
    let recv = responder.conn.recv_msgs.pop_front().unwrap();
    assert_eq!(b"hello world".as_slice(), recv.payload.as_ref());
    assert_eq!(DeliveryMethod::ReliableOrdered, recv.method);

    // the sender should eventually see its send acknowledged
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);
    assert!(initiator.conn.unsent_bytes() == 0);
}

#[test]
fn large_message_is_fragmented_and_reassembled() {
    let mut config = Config::default();
    config.max_transmission_unit = 64;
    let (mut initiator, mut responder, mut now, mut pool) = connected_pair(config);

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    initiator
        .conn
        .send_message(payload.clone(), DeliveryMethod::ReliableOrdered, CHANNEL)
        .unwrap();
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 256);

    assert_eq!(1, responder.conn.recv_msgs.len());
    let recv = responder.conn.recv_msgs.pop_front().unwrap();
    assert_eq!(payload.as_slice(), recv.payload.as_ref());
}

#[test]
fn sequenced_channel_drops_stale_message() {
    let (mut initiator, mut responder, mut now, mut pool) = connected_pair(Config::default());

    initiator
        .conn
        .send_message(b"first".as_slice(), DeliveryMethod::UnreliableSequenced, CHANNEL)
        .unwrap();
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);
    initiator
        .conn
        .send_message(b"second".as_slice(), DeliveryMethod::UnreliableSequenced, CHANNEL)
        .unwrap();
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);

    let received: Vec<_> = responder.conn.recv_msgs.iter().map(|m| m.payload.clone()).collect();
    assert_eq!(2, received.len());
    assert_eq!(b"first".as_slice(), received[0].as_ref());
    assert_eq!(b"second".as_slice(), received[1].as_ref());
}

#[test]
fn disconnect_propagates_to_peer() {
    let (mut initiator, mut responder, mut now, mut pool) = connected_pair(Config::default());

    initiator.conn.disconnect("done talking");
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_millis(50), 16);

    assert_eq!(Status::Disconnected, initiator.conn.status());
    assert_eq!(Status::Disconnected, responder.conn.status());
    let reason = responder.conn.events.iter().find_map(|ev| match ev {
        ConnectionEvent::Disconnected { reason } => Some(reason.clone()),
        _ => None,
    });
    assert_eq!(Some("done talking".to_owned()), reason);
}

#[test]
fn dropped_packet_is_retransmitted_and_eventually_delivered() {
    let (mut initiator, mut responder, mut now, mut pool) = connected_pair(Config::default());

    initiator
        .conn
        .send_message(b"retry me".as_slice(), DeliveryMethod::ReliableOrdered, CHANNEL)
        .unwrap();

    // let the initiator flush the message, then simulate loss by discarding it
    now += Duration::from_millis(50);
    initiator.conn.heartbeat(now, &mut initiator.out, &mut pool);
    assert!(!initiator.out.packets.is_empty());
    initiator.out.packets.clear();
    assert_eq!(1, initiator.conn.stats().msgs_sent);
    assert!(responder.conn.recv_msgs.is_empty());

    // advance well past the resend deadline; the retransmit should get through this time
    pump(&mut initiator, &mut responder, &mut now, &mut pool, Duration::from_secs(1), 16);

    assert_eq!(1, responder.conn.recv_msgs.len());
    assert!(initiator.conn.stats().msgs_sent > 1);
}
