//! SMA Bluetooth protocol stack, bottom up: [`link`] packets on the
//! transport, [`frame`] byte-stuffed frames on the link, [`packet`]
//! application messages in frames, driven by [`session`].

pub mod address;
pub mod archive;
pub mod frame;
pub mod link;
pub mod packet;
pub mod readings;
pub mod record;
pub mod session;
pub mod transaction;
