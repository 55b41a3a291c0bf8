//! Scripted raw-frame peer for exercising a connection end-to-end over an
//! in-memory duplex pipe.

#![allow(dead_code)]

pub mod raw_peer;

pub use raw_peer::RawPeer;
