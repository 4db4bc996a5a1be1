//! Command line peer for `pollrtc`: joins a session through an HTTP
//! rendezvous store and chats over the negotiated data channel, or serves
//! such a store itself.

pub mod chat;
pub mod cli;
pub mod logging;
pub mod rendezvous;
