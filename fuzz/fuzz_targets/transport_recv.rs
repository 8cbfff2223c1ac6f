#![no_main]

use {
    libfuzzer_sys::fuzz_target,
    relnet::{collab::MessagePool, config::Config, conn::Connection, message::OutgoingMessage},
    std::{
        net::{Ipv4Addr, SocketAddr},
        time::Instant,
    },
};

struct NullPool;
impl MessagePool for NullPool {
    fn recycle(&mut self, _msg: OutgoingMessage) {}
}

fuzz_target!(|packet: &[u8]| {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
    let now = Instant::now();
    let mut conn = Connection::accept(addr, 1, Config::default(), now);
    let mut pool = NullPool;
    conn.on_packet(now, packet, &mut pool);
});
