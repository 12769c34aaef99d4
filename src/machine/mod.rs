//! The association protocol machine (PS3.8 §9.2).
//!
//! One machine runs per association, on its own thread.
//! It is fed from a single bounded event queue
//! whose producers are the network reader,
//! the ARTIM timer, the service layer downcalls,
//! and the machine itself
//! (negotiation verdicts and internally detected transport loss).
//! Exactly one action runs per event;
//! the machine loops until it returns to the idle state,
//! at which point the upcall channel is closed and the thread exits.

mod artim;
mod reader;
mod transitions;

pub(crate) use artim::DEFAULT_ARTIM_TIMEOUT;
pub(crate) use transitions::{transition, Action, Event, State};

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{Receiver, SyncSender};
use std::time::Duration;

use crate::association::context::ContextManager;
use crate::association::Upcall;
use crate::dimse::{fragment_into_pdus, CommandAssembler, CommandSet};
use crate::pdu::{
    write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderAcseReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PDataValueType, Pdu, CURRENT_PROTOCOL_VERSION,
};

use self::artim::Artim;

/// One DIMSE message to be sent on the association:
/// the command set and, when the command announces one,
/// the encoded data set.
#[derive(Debug)]
pub(crate) struct DimsePayload {
    pub abstract_syntax_uid: String,
    pub command: CommandSet,
    pub data: Vec<u8>,
}

/// An event posted to the machine's queue,
/// pairing the table event with whatever the action will need.
#[derive(Debug)]
pub(crate) struct StateEvent {
    pub event: Event,
    pub pdu: Option<Pdu>,
    pub conn: Option<TcpStream>,
    pub payload: Option<DimsePayload>,
    pub timer_generation: u64,
}

impl StateEvent {
    pub fn new(event: Event) -> Self {
        StateEvent {
            event,
            pdu: None,
            conn: None,
            payload: None,
            timer_generation: 0,
        }
    }

    pub fn with_pdu(event: Event, pdu: Pdu) -> Self {
        StateEvent {
            pdu: Some(pdu),
            ..StateEvent::new(event)
        }
    }

    pub fn with_conn(event: Event, conn: TcpStream) -> Self {
        StateEvent {
            conn: Some(conn),
            ..StateEvent::new(event)
        }
    }

    pub fn with_payload(event: Event, payload: DimsePayload) -> Self {
        StateEvent {
            payload: Some(payload),
            ..StateEvent::new(event)
        }
    }

    pub fn timer_tick(timer_generation: u64) -> Self {
        StateEvent {
            timer_generation,
            ..StateEvent::new(Event::Evt18)
        }
    }
}

/// Static configuration of one protocol machine.
#[derive(Debug, Clone)]
pub(crate) struct MachineOptions {
    pub label: String,
    /// true on the association requestor side
    pub requestor: bool,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    /// maximum PDU length advertised to the peer
    pub max_pdu_length: u32,
    /// largest PDU admitted from the wire
    pub read_max_pdu_length: u32,
    pub artim_timeout: Duration,
}

pub(crate) struct StateMachine {
    options: MachineOptions,
    state: State,
    contexts: ContextManager,
    assembler: CommandAssembler,
    events_rx: Receiver<StateEvent>,
    events_tx: SyncSender<StateEvent>,
    upcalls: Option<SyncSender<Upcall>>,
    socket: Option<TcpStream>,
    artim: Artim,
}

impl StateMachine {
    pub fn new(
        options: MachineOptions,
        events_rx: Receiver<StateEvent>,
        events_tx: SyncSender<StateEvent>,
        upcalls: SyncSender<Upcall>,
    ) -> Self {
        let artim = Artim::new(events_tx.clone(), options.artim_timeout);
        StateMachine {
            options,
            state: State::Sta01,
            contexts: ContextManager::new(),
            assembler: CommandAssembler::default(),
            events_rx,
            events_tx,
            upcalls: Some(upcalls),
            socket: None,
            artim,
        }
    }

    /// Run the machine until it returns to the idle state.
    pub fn run(mut self, initial: StateEvent) {
        tracing::debug!(label = %self.options.label, "state machine starting");
        self.state = self.apply(initial);
        while self.state != State::Sta01 {
            let Some(event) = self.next_event() else {
                break;
            };
            self.state = self.apply(event);
        }
        self.close_upcall();
        tracing::debug!(label = %self.options.label, "state machine finished");
    }

    /// Block until an event of interest arrives,
    /// discarding stale timer ticks.
    fn next_event(&mut self) -> Option<StateEvent> {
        loop {
            let event = self.events_rx.recv().ok()?;
            if event.event == Event::Evt18 && !self.artim.is_current(event.timer_generation) {
                tracing::trace!(label = %self.options.label, "discarding stale timer tick");
                continue;
            }
            return Some(event);
        }
    }

    /// Dispatch one event through the transition table
    /// and run the selected action, yielding the next state.
    fn apply(&mut self, mut event: StateEvent) -> State {
        if let Some(conn) = event.conn.take() {
            self.socket = Some(conn);
        }
        if event.event == Event::Evt17 {
            // transport is gone: this is where the association ends
            // for the service layer, whatever the current state
            self.close_upcall();
            self.socket = None;
        }

        let action = transition(self.state, event.event);
        tracing::trace!(
            label = %self.options.label,
            state = %self.state,
            event = %event.event,
            action = %action,
            "dispatching event"
        );
        match action {
            Action::Ae1 => self.ae1(),
            Action::Ae2 => self.ae2(),
            Action::Ae3 => self.ae3(event),
            Action::Ae4 => self.ae4(),
            Action::Ae5 => self.ae5(),
            Action::Ae6 => self.ae6(event),
            Action::Ae7 => self.ae7(event),
            Action::Ae8 => self.ae8(event),
            Action::Dt1 => self.dt1(event),
            Action::Dt2 => self.deliver_pdata(event, State::Sta06),
            Action::Ar1 => self.ar1(),
            Action::Ar2 => self.ar2(),
            Action::Ar3 => self.ar3(),
            Action::Ar4 => self.ar4(),
            Action::Ar5 => self.ar5(),
            Action::Ar6 => self.deliver_pdata(event, State::Sta07),
            Action::Ar7 => self.ar7(event),
            Action::Ar8 => self.ar8(),
            Action::Ar9 => self.ar9(),
            Action::Ar10 => self.ar10(),
            Action::Aa1 => self.aa1(),
            Action::Aa2 => self.aa2(),
            Action::Aa3 => self.aa3(),
            Action::Aa4 => self.aa4(),
            Action::Aa5 => self.aa5(),
            Action::Aa6 => self.aa6(),
            Action::Aa7 => self.aa7(),
            Action::Aa8 => self.aa8(),
        }
    }

    // === association establishment ===

    /// AE-1: the transport is being opened by the service layer;
    /// evt02 or evt17 follows.
    fn ae1(&mut self) -> State {
        State::Sta04
    }

    /// AE-2: transport open on the requestor side;
    /// send A-ASSOCIATE-RQ and start the ARTIM timer.
    fn ae2(&mut self) -> State {
        self.begin_reading();
        let presentation_contexts = self.contexts.propose(
            &self.options.abstract_syntaxes,
            &self.options.transfer_syntaxes,
        );
        let user_variables = self.contexts.user_variables(self.options.max_pdu_length);
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            calling_ae_title: self.options.calling_ae_title.clone(),
            called_ae_title: self.options.called_ae_title.clone(),
            application_context_name: self.options.application_context_name.clone(),
            presentation_contexts,
            user_variables,
        });
        self.send_pdu(&pdu);
        self.artim.start();
        State::Sta05
    }

    /// AE-3: association accepted by the peer.
    fn ae3(&mut self, event: StateEvent) -> State {
        self.artim.stop();
        let Some(Pdu::AssociationAC(ac)) = event.pdu else {
            return self.aa8();
        };
        match self.contexts.apply_response(&ac) {
            Ok(()) => {
                self.upcall_handshake();
                State::Sta06
            }
            Err(e) => {
                tracing::warn!(
                    label = %self.options.label,
                    "unusable association acceptance: {}", e
                );
                self.aa8()
            }
        }
    }

    /// AE-4: association rejected by the peer.
    fn ae4(&mut self) -> State {
        self.close_transport();
        State::Sta01
    }

    /// AE-5: transport accepted on the acceptor side;
    /// start the ARTIM timer and begin reading.
    fn ae5(&mut self) -> State {
        self.artim.start();
        self.begin_reading();
        State::Sta02
    }

    /// AE-6: examine the A-ASSOCIATE-RQ.
    ///
    /// A wrong protocol version is refused on the spot.
    /// Otherwise the contexts are negotiated and the verdict is
    /// posted back to the queue as evt07 (accept, with the prepared
    /// A-ASSOCIATE-AC) or evt08 (reject).
    fn ae6(&mut self, event: StateEvent) -> State {
        self.artim.stop();
        let Some(Pdu::AssociationRQ(rq)) = event.pdu else {
            return self.aa8();
        };

        if rq.protocol_version != CURRENT_PROTOCOL_VERSION {
            tracing::warn!(
                label = %self.options.label,
                "unsupported protocol version {:#06x}", rq.protocol_version
            );
            self.send_pdu(&Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                ),
            }));
            self.artim.start();
            return State::Sta13;
        }

        if rq.calling_ae_title.trim().is_empty() {
            self.post_reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ));
            return State::Sta03;
        }
        if rq.called_ae_title.trim().is_empty() {
            self.post_reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ));
            return State::Sta03;
        }

        match self.contexts.negotiate(
            &rq,
            &self.options.abstract_syntaxes,
            &self.options.transfer_syntaxes,
        ) {
            Ok(results) => {
                let ac = AssociationAC {
                    protocol_version: CURRENT_PROTOCOL_VERSION,
                    calling_ae_title: rq.calling_ae_title,
                    called_ae_title: rq.called_ae_title,
                    application_context_name: rq.application_context_name,
                    presentation_contexts: results,
                    user_variables: self.contexts.user_variables(self.options.max_pdu_length),
                };
                self.post(StateEvent::with_pdu(Event::Evt07, Pdu::AssociationAC(ac)));
            }
            Err(e) => {
                tracing::warn!(
                    label = %self.options.label,
                    "association negotiation failed: {}", e
                );
                self.post_reject(AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::NoReasonGiven,
                ));
            }
        }
        State::Sta03
    }

    /// AE-7: send the prepared A-ASSOCIATE-AC.
    fn ae7(&mut self, event: StateEvent) -> State {
        let Some(pdu @ Pdu::AssociationAC(_)) = event.pdu else {
            return self.aa8();
        };
        self.send_pdu(&pdu);
        self.upcall_handshake();
        State::Sta06
    }

    /// AE-8: send the prepared A-ASSOCIATE-RJ and start the ARTIM timer.
    fn ae8(&mut self, event: StateEvent) -> State {
        let Some(pdu @ Pdu::AssociationRJ(_)) = event.pdu else {
            return self.aa8();
        };
        self.send_pdu(&pdu);
        self.artim.start();
        State::Sta13
    }

    // === data transfer ===

    /// DT-1: fragment and send one DIMSE message.
    fn dt1(&mut self, event: StateEvent) -> State {
        let Some(payload) = event.payload else {
            return State::Sta06;
        };
        self.send_dimse_payload(payload, State::Sta06)
    }

    /// DT-2 / AR-6: feed an inbound P-DATA-TF to the assembler
    /// and raise a data indication once a message is complete.
    fn deliver_pdata(&mut self, event: StateEvent, next: State) -> State {
        let Some(Pdu::PData { data }) = event.pdu else {
            return self.aa8();
        };
        match self.assembler.add(&data) {
            Ok(Some((context_id, command, data))) => {
                tracing::trace!(
                    label = %self.options.label,
                    context_id,
                    "DIMSE message complete"
                );
                self.upcall(Upcall::Data {
                    context_id,
                    command,
                    data,
                });
                next
            }
            Ok(None) => next,
            Err(e) => {
                tracing::warn!(
                    label = %self.options.label,
                    "could not assemble inbound message: {}", e
                );
                self.aa8()
            }
        }
    }

    /// Fragment one DIMSE message into P-DATA-TF PDUs and write them out
    /// contiguously: every command fragment, then every data fragment.
    /// Local failures are turned into an abort request (evt15).
    fn send_dimse_payload(&mut self, payload: DimsePayload, next: State) -> State {
        let Some(context) = self
            .contexts
            .lookup_by_abstract_syntax(&payload.abstract_syntax_uid)
        else {
            tracing::warn!(
                label = %self.options.label,
                "no accepted presentation context for {}", payload.abstract_syntax_uid
            );
            self.post(StateEvent::new(Event::Evt15));
            return next;
        };
        let context_id = context.id;
        let max_pdu_length = self.contexts.peer_max_pdu_length();

        let command_bytes = match payload.command.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    label = %self.options.label,
                    "could not encode command set: {}", e
                );
                self.post(StateEvent::new(Event::Evt15));
                return next;
            }
        };

        let mut pdus = match fragment_into_pdus(
            context_id,
            max_pdu_length,
            PDataValueType::Command,
            &command_bytes,
        ) {
            Ok(pdus) => pdus,
            Err(e) => {
                tracing::warn!(label = %self.options.label, "{}", e);
                self.post(StateEvent::new(Event::Evt15));
                return next;
            }
        };

        if payload.command.has_data() {
            match fragment_into_pdus(
                context_id,
                max_pdu_length,
                PDataValueType::Data,
                &payload.data,
            ) {
                Ok(more) => pdus.extend(more),
                Err(e) => {
                    tracing::warn!(label = %self.options.label, "{}", e);
                    self.post(StateEvent::new(Event::Evt15));
                    return next;
                }
            }
        } else if !payload.data.is_empty() {
            tracing::warn!(
                label = %self.options.label,
                "command announces no data set; dropping {} bytes", payload.data.len()
            );
        }

        for pdu in &pdus {
            self.send_pdu(pdu);
        }
        next
    }

    // === association release ===

    /// AR-1: send A-RELEASE-RQ.
    fn ar1(&mut self) -> State {
        self.send_pdu(&Pdu::ReleaseRQ);
        State::Sta07
    }

    /// AR-2: the peer asked to release;
    /// the release response comes right back as evt14.
    fn ar2(&mut self) -> State {
        self.post(StateEvent::new(Event::Evt14));
        State::Sta08
    }

    /// AR-3: release confirmed; reply and close the transport.
    fn ar3(&mut self) -> State {
        self.send_pdu(&Pdu::ReleaseRP);
        self.close_transport();
        State::Sta01
    }

    /// AR-4: send A-RELEASE-RP and wait for the transport to close.
    fn ar4(&mut self) -> State {
        self.send_pdu(&Pdu::ReleaseRP);
        self.artim.start();
        State::Sta13
    }

    /// AR-5: transport closed after release.
    fn ar5(&mut self) -> State {
        self.artim.stop();
        self.close_transport();
        State::Sta01
    }

    /// AR-7: send a DIMSE message while the peer awaits our release
    /// response, then respond to the release.
    fn ar7(&mut self, event: StateEvent) -> State {
        let next = match event.payload {
            Some(payload) => self.send_dimse_payload(payload, State::Sta08),
            None => State::Sta08,
        };
        self.post(StateEvent::new(Event::Evt14));
        next
    }

    /// AR-8: release collision.
    fn ar8(&mut self) -> State {
        if self.options.requestor {
            State::Sta09
        } else {
            State::Sta10
        }
    }

    /// AR-9: send A-RELEASE-RP (collision, requestor side).
    fn ar9(&mut self) -> State {
        self.send_pdu(&Pdu::ReleaseRP);
        State::Sta11
    }

    /// AR-10: release confirmed locally (collision, acceptor side);
    /// the A-RELEASE-RP goes out with AR-4 once evt14 arrives.
    fn ar10(&mut self) -> State {
        State::Sta12
    }

    // === aborts ===

    /// AA-1: abort requested locally (service-user source).
    fn aa1(&mut self) -> State {
        self.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        self.artim.restart();
        State::Sta13
    }

    /// AA-2: stop the timer and drop the transport.
    fn aa2(&mut self) -> State {
        self.artim.stop();
        self.close_transport();
        State::Sta01
    }

    /// AA-3: peer aborted the association.
    fn aa3(&mut self) -> State {
        self.close_transport();
        State::Sta01
    }

    /// AA-4: transport loss while the association was in progress.
    fn aa4(&mut self) -> State {
        self.close_transport();
        State::Sta01
    }

    /// AA-5: transport closed before the association existed.
    fn aa5(&mut self) -> State {
        self.artim.stop();
        self.close_transport();
        State::Sta01
    }

    /// AA-6: ignore a PDU while waiting for the transport to close.
    fn aa6(&mut self) -> State {
        State::Sta13
    }

    /// AA-7: refuse a PDU while waiting for the transport to close.
    fn aa7(&mut self) -> State {
        self.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        State::Sta13
    }

    /// AA-8: protocol violation; abort with a service-provider source
    /// and bound the wait for the transport to close.
    fn aa8(&mut self) -> State {
        self.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ),
        });
        self.artim.start();
        State::Sta13
    }

    // === plumbing ===

    /// Spawn the network reader over a second handle of the socket.
    fn begin_reading(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        match socket.try_clone() {
            Ok(read_half) => reader::spawn_network_reader(
                read_half,
                self.events_tx.clone(),
                self.options.read_max_pdu_length,
                self.options.label.clone(),
            ),
            Err(e) => {
                tracing::error!(
                    label = %self.options.label,
                    "could not obtain a read handle on the transport: {}", e
                );
                self.drop_transport();
            }
        }
    }

    /// Encode and write one PDU to the socket.
    /// A write failure closes the socket and surfaces as evt17.
    fn send_pdu(&mut self, pdu: &Pdu) {
        let Some(socket) = &mut self.socket else {
            tracing::warn!(
                label = %self.options.label,
                "no transport to send {}", pdu.short_description()
            );
            return;
        };
        let mut buffer = Vec::new();
        if let Err(e) = write_pdu(&mut buffer, pdu) {
            tracing::error!(
                label = %self.options.label,
                "could not encode {}: {}", pdu.short_description(), e
            );
            self.drop_transport();
            return;
        }
        if let Err(e) = socket.write_all(&buffer) {
            tracing::warn!(
                label = %self.options.label,
                "could not write {}: {}", pdu.short_description(), e
            );
            self.drop_transport();
            return;
        }
        tracing::trace!(label = %self.options.label, "sent {}", pdu.short_description());
    }

    /// Close the socket on a local failure and post evt17.
    ///
    /// The event may be dropped when the queue is full; in that case
    /// the network reader notices the closed socket and posts it instead.
    fn drop_transport(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        let _ = self.events_tx.try_send(StateEvent::new(Event::Evt17));
    }

    /// Close the upcall channel and the socket, exactly once each.
    fn close_transport(&mut self) {
        self.close_upcall();
        if let Some(socket) = self.socket.take() {
            tracing::trace!(label = %self.options.label, "closing transport connection");
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn close_upcall(&mut self) {
        self.upcalls.take();
    }

    fn upcall(&mut self, upcall: Upcall) {
        if let Some(tx) = &self.upcalls {
            // failure means the service layer hung up; nothing to do
            let _ = tx.send(upcall);
        }
    }

    fn upcall_handshake(&mut self) {
        self.upcall(Upcall::HandshakeCompleted {
            contexts: self.contexts.snapshot(),
            peer_max_pdu_length: self.contexts.peer_max_pdu_length(),
        });
    }

    fn post(&mut self, event: StateEvent) {
        let _ = self.events_tx.send(event);
    }

    fn post_reject(&mut self, source: AssociationRJSource) {
        self.post(StateEvent::with_pdu(
            Event::Evt08,
            Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source,
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{read_pdu, MAXIMUM_PDU_SIZE};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc::{sync_channel, Receiver};
    use std::time::Duration;

    /// A machine wired to one end of a localhost socket pair.
    fn test_machine(
        requestor: bool,
    ) -> (StateMachine, TcpStream, Receiver<Upcall>, Receiver<StateEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let local = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let (events_tx, events_rx) = sync_channel(128);
        let (upcalls_tx, upcalls_rx) = sync_channel(128);
        let options = MachineOptions {
            label: "test".to_string(),
            requestor,
            calling_ae_title: "AET_A".to_string(),
            called_ae_title: "AET_B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            abstract_syntaxes: vec!["1.2.840.10008.1.1".to_string()],
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            max_pdu_length: 16_384,
            read_max_pdu_length: MAXIMUM_PDU_SIZE,
            artim_timeout: Duration::from_millis(100),
        };
        let mut machine = StateMachine::new(options, events_rx, events_tx, upcalls_tx);
        machine.socket = Some(local);
        // steal the receiver back out for event inspection: the tests
        // drive `apply` directly instead of running the event loop
        let (stub_tx, stub_rx) = sync_channel(128);
        let events_rx = std::mem::replace(&mut machine.events_rx, stub_rx);
        drop(stub_tx);
        (machine, peer, upcalls_rx, events_rx)
    }

    fn read_peer_pdu(peer: &mut TcpStream) -> Pdu {
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        read_pdu(peer, MAXIMUM_PDU_SIZE).unwrap()
    }

    #[test]
    fn release_collision_on_the_requestor_side() {
        let (mut sm, mut peer, _upcalls, _events) = test_machine(true);
        sm.state = State::Sta07;

        sm.state = sm.apply(StateEvent::with_pdu(Event::Evt12, Pdu::ReleaseRQ));
        assert_eq!(sm.state, State::Sta09);

        sm.state = sm.apply(StateEvent::new(Event::Evt14));
        assert_eq!(sm.state, State::Sta11);
        assert_eq!(read_peer_pdu(&mut peer), Pdu::ReleaseRP);

        sm.state = sm.apply(StateEvent::with_pdu(Event::Evt13, Pdu::ReleaseRP));
        assert_eq!(sm.state, State::Sta01);
    }

    #[test]
    fn release_collision_on_the_acceptor_side() {
        let (mut sm, mut peer, _upcalls, _events) = test_machine(false);
        sm.state = State::Sta07;

        sm.state = sm.apply(StateEvent::with_pdu(Event::Evt12, Pdu::ReleaseRQ));
        assert_eq!(sm.state, State::Sta10);

        sm.state = sm.apply(StateEvent::with_pdu(Event::Evt13, Pdu::ReleaseRP));
        assert_eq!(sm.state, State::Sta12);

        sm.state = sm.apply(StateEvent::new(Event::Evt14));
        assert_eq!(sm.state, State::Sta13);
        assert_eq!(read_peer_pdu(&mut peer), Pdu::ReleaseRP);
    }

    #[test]
    fn transport_loss_reaches_idle_from_every_state() {
        for state in State::ALL {
            if state == State::Sta01 {
                continue;
            }
            let (mut sm, _peer, _upcalls, _events) = test_machine(true);
            sm.state = state;
            sm.state = sm.apply(StateEvent::new(Event::Evt17));
            assert_eq!(sm.state, State::Sta01, "from {}", state);
        }
    }

    #[test]
    fn timer_expiry_converges_to_idle() {
        // from the half-closed wait state, expiry closes everything
        let (mut sm, _peer, _upcalls, _events) = test_machine(false);
        sm.state = State::Sta13;
        sm.state = sm.apply(StateEvent::timer_tick(0));
        assert_eq!(sm.state, State::Sta01);

        // pending the A-ASSOCIATE reply, expiry aborts first
        let (mut sm, mut peer, _upcalls, _events) = test_machine(true);
        sm.state = State::Sta05;
        sm.state = sm.apply(StateEvent::timer_tick(0));
        assert_eq!(sm.state, State::Sta13);
        assert!(matches!(
            read_peer_pdu(&mut peer),
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(_)
            }
        ));
        sm.state = sm.apply(StateEvent::new(Event::Evt17));
        assert_eq!(sm.state, State::Sta01);
    }

    #[test]
    fn protocol_violation_in_established_state_aborts() {
        let (mut sm, mut peer, _upcalls, _events) = test_machine(true);
        sm.state = State::Sta06;
        // an A-ASSOCIATE-AC is not acceptable once established
        sm.state = sm.apply(StateEvent::with_pdu(
            Event::Evt03,
            Pdu::ReleaseRP, // payload is irrelevant for the table
        ));
        assert_eq!(sm.state, State::Sta13);
        assert!(matches!(
            read_peer_pdu(&mut peer),
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(_)
            }
        ));
    }

    #[test]
    fn upcall_channel_closes_exactly_once() {
        let (mut sm, _peer, upcalls, _events) = test_machine(true);
        sm.state = State::Sta06;
        sm.state = sm.apply(StateEvent::new(Event::Evt17));
        assert_eq!(sm.state, State::Sta01);
        // closing again must be harmless
        sm.close_upcall();
        assert!(upcalls.try_recv().is_err());
    }
}
