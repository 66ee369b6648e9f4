//! Scrapyard: a peer-to-peer catalog of static web bundles.
//!
//! Every node keeps a private local store of site files and a replicated
//! catalog of site metadata. The catalog is a CRDT-tracked relational table
//! that converges across all peers in a room; bulk file content moves only
//! on explicit request, over the same WebRTC data channels the catalog
//! syncs on.
//!
//! The pieces:
//! - [`catalog`]: the engine, with the catalog API, sync protocol, and
//!   event surface
//! - [`signaling`]: reconnecting WebSocket client for room membership and
//!   offer/answer/ICE exchange
//! - [`peer`]: one peer connection and one ordered reliable `ledger`
//!   channel per remote peer
//! - [`transfer`]: the file-transfer sub-protocol (list, request, chunks)
//! - [`http`]: the `/local/{siteId}/...` interceptor serving cached blobs
//!
//! Storage is injected: a [`scrapyard_types::crdt_store::CrdtStore`] for the
//! catalog and a [`scrapyard_types::content_store::ContentStore`] for blobs.

pub mod catalog;
pub mod config;
pub mod events;
pub mod http;
pub mod peer;
pub mod prelude;
pub mod signaling;
pub mod transfer;

pub use catalog::Catalog;
pub use config::Config;
pub use events::EngineEvent;

// vim: ts=4
