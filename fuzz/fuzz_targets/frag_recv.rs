#![no_main]

use {
    libfuzzer_sys::fuzz_target,
    relnet::{frag::FragmentReceiver, limit::ByteBucket, seq::Seq},
};

fuzz_target!(|input: (relnet::frag::FragmentPosition, &[u8])| {
    let (position, payload) = input;

    const MAX_FRAG_LEN: usize = 32;
    const MSG_SEQ: Seq = Seq(0);

    let mut recv = FragmentReceiver::default();
    let mut budget = ByteBucket::new(usize::MAX);
    _ = recv.reassemble(MAX_FRAG_LEN, &mut budget, MSG_SEQ, position, payload);
});
