//! `Meridian` Server: service-entry dispatch, RPC transport and TCC transactions.

pub mod network;
pub mod service;
pub mod tcc;
pub mod transport;
