//! This crate implements the DICOM upper layer protocol (PS3.8):
//! the association state machine and the PDU transport
//! which carry DIMSE messages between application entities over TCP.
//!
//! - The [`pdu`] module provides the protocol data unit types
//!   and their wire codec.
//! - The [`dimse`] module provides the command set codec,
//!   the fragmentation of outbound messages into P-DATA-TF PDUs
//!   and the reassembly of inbound fragments.
//! - The [`association`] module provides the association engine:
//!   a per-connection protocol machine driven by typed events,
//!   with an upcall/downcall surface for service class implementations.
//!
//! The engine covers one association from transport handoff
//! to transport close; re-dialing and retry policy belong to
//! the layer above.

pub mod association;
pub mod dimse;
pub mod pdu;

mod machine;

/// The implementation class UID advertised during negotiation.
///
/// Generated as per PS3.5 §B.2. This UID may change between versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137236999224152473511375329311903550383";

/// The implementation version name advertised during negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicom-dul 0.1.0";

// re-exports

pub use association::{AcceptorOptions, Association, RequestorOptions, Upcall};
pub use dimse::{CommandField, CommandSet, Status};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
