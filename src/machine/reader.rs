//! The network reader task.
//!
//! One reader per association owns the inbound half of the socket.
//! It frames PDUs and posts them as typed events in arrival order,
//! then exits on the first transport or framing failure:
//! a clean end of stream becomes `evt17`,
//! anything else becomes `evt19` and is left
//! for the state machine to resolve.

use std::net::TcpStream;
use std::sync::mpsc::SyncSender;
use std::thread;

use crate::pdu::{read_pdu, reader::ReadError, Pdu};

use super::{Event, StateEvent};

pub(crate) fn spawn_network_reader(
    mut stream: TcpStream,
    events: SyncSender<StateEvent>,
    max_pdu_length: u32,
    label: String,
) {
    thread::spawn(move || {
        tracing::trace!(label = %label, max_pdu_length, "network reader starting");
        loop {
            match read_pdu(&mut stream, max_pdu_length) {
                Ok(pdu) => {
                    tracing::trace!(label = %label, "received {}", pdu.short_description());
                    let event = classify(pdu);
                    // an unrecognized PDU ends the reading loop;
                    // the machine decides what happens to the association
                    let stop = event.event == Event::Evt19;
                    if events.send(event).is_err() || stop {
                        break;
                    }
                }
                Err(ReadError::NoPduAvailable { .. }) => {
                    tracing::trace!(label = %label, "transport closed by peer");
                    let _ = events.send(StateEvent::new(Event::Evt17));
                    break;
                }
                Err(e) => {
                    tracing::warn!(label = %label, "could not read PDU: {}", e);
                    let _ = events.send(StateEvent::new(Event::Evt19));
                    break;
                }
            }
        }
        tracing::trace!(label = %label, "network reader finished");
    });
}

/// Map a framed PDU to the event it raises in the protocol machine.
fn classify(pdu: Pdu) -> StateEvent {
    let event = match &pdu {
        Pdu::AssociationAC { .. } => Event::Evt03,
        Pdu::AssociationRJ { .. } => Event::Evt04,
        Pdu::AssociationRQ { .. } => Event::Evt06,
        Pdu::PData { .. } => Event::Evt10,
        Pdu::ReleaseRQ => Event::Evt12,
        Pdu::ReleaseRP => Event::Evt13,
        Pdu::AbortRQ { .. } => Event::Evt16,
        Pdu::Unknown { pdu_type, .. } => {
            tracing::warn!("peer sent a PDU of unknown type {:#04x}", pdu_type);
            Event::Evt19
        }
    };
    StateEvent::with_pdu(event, pdu)
}
