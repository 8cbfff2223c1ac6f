#![no_main]

use {
    libfuzzer_sys::fuzz_target,
    relnet::{
        collab::{ConnectionReset, MessagePool, PacketSink},
        config::Config,
        conn::{Connection, Status},
        lane::{ChannelIndex, DeliveryMethod},
        message::OutgoingMessage,
    },
    std::{
        collections::VecDeque,
        net::{Ipv4Addr, SocketAddr},
        time::{Duration, Instant},
    },
};

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

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fuzz_target!(|input: (DeliveryMethod, u8, &[u8])| {
    let (method, raw_channel, payload) = input;
    if payload.is_empty() {
        return;
    }

    let mut config = Config::default();
    config.max_transmission_unit = 128;
    config.channels_per_delivery_method = 4;
    let channel = ChannelIndex(raw_channel % config.channels_per_delivery_method);

    let init_now = Instant::now();
    let mut initiator = Connection::connect(addr(1), 1, config.clone(), init_now);
    let mut responder = Connection::accept(addr(2), 2, config, init_now);
    let mut pool = NullPool;
    let mut to_responder = Channel::default();
    let mut to_initiator = Channel::default();

    let mut now = init_now;
    let mut sent = false;
    for _ in 0..64 {
        now += Duration::from_millis(50);
        initiator.heartbeat(now, &mut to_responder, &mut pool);
        responder.heartbeat(now, &mut to_initiator, &mut pool);

        while let Some(packet) = to_responder.packets.pop_front() {
            responder.on_packet(now, &packet, &mut pool);
        }
        while let Some(packet) = to_initiator.packets.pop_front() {
            initiator.on_packet(now, &packet, &mut pool);
        }

        if !sent && initiator.status() == Status::Connected {
            _ = initiator.send_message(payload.to_vec(), method, channel);
            sent = true;
        }
    }

    _ = (initiator.recv_msgs.len(), responder.recv_msgs.len());
});
