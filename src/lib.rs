#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = concat!(
    "Reliability and ordering layer over an unreliable datagram transport.\n\n",
    "Wraps an unreliable, unordered packet transport (UDP, or anything with \
     equivalent semantics) with configurable per-channel delivery guarantees: \
     unreliable, unreliable-sequenced, reliable-unordered, reliable-sequenced, \
     and reliable-ordered. See [`conn::Connection`] for the entry point, and \
     [`collab`] for the traits a caller implements to drive it."
)]

pub mod ack;
pub mod channel;
pub mod collab;
pub mod config;
pub mod conn;
pub mod error;
pub mod frag;
pub mod lane;
pub mod library;
pub mod limit;
pub mod message;
pub mod rtt;
pub mod seq;
