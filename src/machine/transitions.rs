//! States, events and actions of the upper layer protocol machine,
//! with the transition table of PS3.8 Table 9-10.

use std::fmt;

/// The thirteen states of the protocol machine (PS3.8 Table 9-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Idle, no association and no transport connection
    Sta01,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ PDU
    Sta02,
    /// Awaiting the local A-ASSOCIATE response primitive
    Sta03,
    /// Awaiting transport connection opening to complete
    Sta04,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta05,
    /// Association established and ready for data transfer
    Sta06,
    /// Awaiting A-RELEASE-RP PDU
    Sta07,
    /// Awaiting the local A-RELEASE response primitive
    Sta08,
    /// Release collision, requestor side: awaiting the local release response
    Sta09,
    /// Release collision, acceptor side: awaiting A-RELEASE-RP PDU
    Sta10,
    /// Release collision, requestor side: awaiting A-RELEASE-RP PDU
    Sta11,
    /// Release collision, acceptor side: awaiting the local release response
    Sta12,
    /// Awaiting the transport connection close indication
    Sta13,
}

impl State {
    pub const ALL: [State; 13] = [
        State::Sta01,
        State::Sta02,
        State::Sta03,
        State::Sta04,
        State::Sta05,
        State::Sta06,
        State::Sta07,
        State::Sta08,
        State::Sta09,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];

    pub fn description(self) -> &'static str {
        match self {
            State::Sta01 => "Idle",
            State::Sta02 => "Transport connection open (awaiting A-ASSOCIATE-RQ PDU)",
            State::Sta03 => "Awaiting local A-ASSOCIATE response primitive",
            State::Sta04 => "Awaiting transport connection opening to complete",
            State::Sta05 => "Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU",
            State::Sta06 => "Association established and ready for data transfer",
            State::Sta07 => "Awaiting A-RELEASE-RP PDU",
            State::Sta08 => "Awaiting local A-RELEASE response primitive",
            State::Sta09 => "Release collision requestor side; awaiting local release response",
            State::Sta10 => "Release collision acceptor side; awaiting A-RELEASE-RP PDU",
            State::Sta11 => "Release collision requestor side; awaiting A-RELEASE-RP PDU",
            State::Sta12 => "Release collision acceptor side; awaiting local release response",
            State::Sta13 => "Awaiting transport connection close indication",
        }
    }

    fn number(self) -> u8 {
        match self {
            State::Sta01 => 1,
            State::Sta02 => 2,
            State::Sta03 => 3,
            State::Sta04 => 4,
            State::Sta05 => 5,
            State::Sta06 => 6,
            State::Sta07 => 7,
            State::Sta08 => 8,
            State::Sta09 => 9,
            State::Sta10 => 10,
            State::Sta11 => 11,
            State::Sta12 => 12,
            State::Sta13 => 13,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sta{:02} ({})", self.number(), self.description())
    }
}

/// The nineteen events driving the protocol machine (PS3.8 Table 9-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A-ASSOCIATE request primitive from the local user
    Evt01,
    /// Transport connection established (requestor side)
    Evt02,
    /// A-ASSOCIATE-AC PDU received
    Evt03,
    /// A-ASSOCIATE-RJ PDU received
    Evt04,
    /// Transport connection accepted (acceptor side)
    Evt05,
    /// A-ASSOCIATE-RQ PDU received
    Evt06,
    /// A-ASSOCIATE response primitive (accept)
    Evt07,
    /// A-ASSOCIATE response primitive (reject)
    Evt08,
    /// P-DATA request primitive
    Evt09,
    /// P-DATA-TF PDU received
    Evt10,
    /// A-RELEASE request primitive
    Evt11,
    /// A-RELEASE-RQ PDU received
    Evt12,
    /// A-RELEASE-RP PDU received
    Evt13,
    /// A-RELEASE response primitive
    Evt14,
    /// A-ABORT request primitive
    Evt15,
    /// A-ABORT PDU received
    Evt16,
    /// Transport connection closed
    Evt17,
    /// ARTIM timer expired
    Evt18,
    /// Unrecognized or invalid PDU received
    Evt19,
}

impl Event {
    pub const ALL: [Event; 19] = [
        Event::Evt01,
        Event::Evt02,
        Event::Evt03,
        Event::Evt04,
        Event::Evt05,
        Event::Evt06,
        Event::Evt07,
        Event::Evt08,
        Event::Evt09,
        Event::Evt10,
        Event::Evt11,
        Event::Evt12,
        Event::Evt13,
        Event::Evt14,
        Event::Evt15,
        Event::Evt16,
        Event::Evt17,
        Event::Evt18,
        Event::Evt19,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Event::Evt01 => "A-ASSOCIATE request (local user)",
            Event::Evt02 => "Transport connection established",
            Event::Evt03 => "A-ASSOCIATE-AC PDU received",
            Event::Evt04 => "A-ASSOCIATE-RJ PDU received",
            Event::Evt05 => "Transport connection accepted",
            Event::Evt06 => "A-ASSOCIATE-RQ PDU received",
            Event::Evt07 => "A-ASSOCIATE response primitive (accept)",
            Event::Evt08 => "A-ASSOCIATE response primitive (reject)",
            Event::Evt09 => "P-DATA request primitive",
            Event::Evt10 => "P-DATA-TF PDU received",
            Event::Evt11 => "A-RELEASE request primitive",
            Event::Evt12 => "A-RELEASE-RQ PDU received",
            Event::Evt13 => "A-RELEASE-RP PDU received",
            Event::Evt14 => "A-RELEASE response primitive",
            Event::Evt15 => "A-ABORT request primitive",
            Event::Evt16 => "A-ABORT PDU received",
            Event::Evt17 => "Transport connection closed",
            Event::Evt18 => "ARTIM timer expired",
            Event::Evt19 => "Unrecognized or invalid PDU received",
        }
    }

    fn number(self) -> u8 {
        match self {
            Event::Evt01 => 1,
            Event::Evt02 => 2,
            Event::Evt03 => 3,
            Event::Evt04 => 4,
            Event::Evt05 => 5,
            Event::Evt06 => 6,
            Event::Evt07 => 7,
            Event::Evt08 => 8,
            Event::Evt09 => 9,
            Event::Evt10 => 10,
            Event::Evt11 => 11,
            Event::Evt12 => 12,
            Event::Evt13 => 13,
            Event::Evt14 => 14,
            Event::Evt15 => 15,
            Event::Evt16 => 16,
            Event::Evt17 => 17,
            Event::Evt18 => 18,
            Event::Evt19 => 19,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt{:02} ({})", self.number(), self.description())
    }
}

/// The actions of PS3.8 §9.2.2 and §9.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Issue a transport connect request
    Ae1,
    /// Send A-ASSOCIATE-RQ and start the ARTIM timer
    Ae2,
    /// Confirm association acceptance to the local user
    Ae3,
    /// Confirm association rejection and close the transport
    Ae4,
    /// Start the ARTIM timer and begin reading from the transport
    Ae5,
    /// Examine the association request and consult the local user
    Ae6,
    /// Send A-ASSOCIATE-AC
    Ae7,
    /// Send A-ASSOCIATE-RJ and start the ARTIM timer
    Ae8,
    /// Fragment and send a DIMSE message as P-DATA-TF PDUs
    Dt1,
    /// Assemble an inbound P-DATA-TF PDU
    Dt2,
    /// Send A-RELEASE-RQ
    Ar1,
    /// Indicate a release request to the local user
    Ar2,
    /// Confirm the release and close the transport
    Ar3,
    /// Send A-RELEASE-RP and start the ARTIM timer
    Ar4,
    /// Stop the ARTIM timer
    Ar5,
    /// Deliver P-DATA received while releasing
    Ar6,
    /// Send a DIMSE message while a release is pending
    Ar7,
    /// Indicate a release collision
    Ar8,
    /// Send A-RELEASE-RP (collision, requestor side)
    Ar9,
    /// Confirm the release (collision, acceptor side)
    Ar10,
    /// Send A-ABORT (service-user source) and restart the ARTIM timer
    Aa1,
    /// Stop the ARTIM timer and close the transport
    Aa2,
    /// Indicate an abort and close the transport
    Aa3,
    /// Indicate a provider abort
    Aa4,
    /// Stop the ARTIM timer
    Aa5,
    /// Ignore the PDU
    Aa6,
    /// Send A-ABORT
    Aa7,
    /// Send A-ABORT (service-provider source) and start the ARTIM timer
    Aa8,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Ae1 => "AE-1",
            Action::Ae2 => "AE-2",
            Action::Ae3 => "AE-3",
            Action::Ae4 => "AE-4",
            Action::Ae5 => "AE-5",
            Action::Ae6 => "AE-6",
            Action::Ae7 => "AE-7",
            Action::Ae8 => "AE-8",
            Action::Dt1 => "DT-1",
            Action::Dt2 => "DT-2",
            Action::Ar1 => "AR-1",
            Action::Ar2 => "AR-2",
            Action::Ar3 => "AR-3",
            Action::Ar4 => "AR-4",
            Action::Ar5 => "AR-5",
            Action::Ar6 => "AR-6",
            Action::Ar7 => "AR-7",
            Action::Ar8 => "AR-8",
            Action::Ar9 => "AR-9",
            Action::Ar10 => "AR-10",
            Action::Aa1 => "AA-1",
            Action::Aa2 => "AA-2",
            Action::Aa3 => "AA-3",
            Action::Aa4 => "AA-4",
            Action::Aa5 => "AA-5",
            Action::Aa6 => "AA-6",
            Action::Aa7 => "AA-7",
            Action::Aa8 => "AA-8",
        };
        f.write_str(name)
    }
}

/// The transition table.
///
/// Pairs which PS3.8 Table 9-10 leaves undefined are protocol violations
/// and resolve to [`Action::Aa2`]: stop the timer and drop the transport.
pub fn transition(state: State, event: Event) -> Action {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Sta01, Evt01) => Ae1,
        (Sta01, Evt05) => Ae5,

        (Sta02, Evt03) => Aa1,
        (Sta02, Evt04) => Aa1,
        (Sta02, Evt06) => Ae6,
        (Sta02, Evt10) => Aa1,
        (Sta02, Evt12) => Aa1,
        (Sta02, Evt13) => Aa1,
        (Sta02, Evt16) => Aa2,
        (Sta02, Evt17) => Aa5,
        (Sta02, Evt18) => Aa2,
        (Sta02, Evt19) => Aa1,

        (Sta03, Evt03) => Aa8,
        (Sta03, Evt04) => Aa8,
        (Sta03, Evt06) => Aa8,
        (Sta03, Evt07) => Ae7,
        (Sta03, Evt08) => Ae8,
        (Sta03, Evt10) => Aa8,
        (Sta03, Evt12) => Aa8,
        (Sta03, Evt13) => Aa8,
        (Sta03, Evt15) => Aa1,
        (Sta03, Evt16) => Aa3,
        (Sta03, Evt17) => Aa4,
        (Sta03, Evt19) => Aa8,

        (Sta04, Evt02) => Ae2,
        (Sta04, Evt15) => Aa2,
        (Sta04, Evt17) => Aa4,

        (Sta05, Evt03) => Ae3,
        (Sta05, Evt04) => Ae4,
        (Sta05, Evt06) => Aa8,
        (Sta05, Evt10) => Aa8,
        (Sta05, Evt12) => Aa8,
        (Sta05, Evt13) => Aa8,
        (Sta05, Evt15) => Aa1,
        (Sta05, Evt16) => Aa3,
        (Sta05, Evt17) => Aa4,
        (Sta05, Evt18) => Aa8,
        (Sta05, Evt19) => Aa8,

        (Sta06, Evt03) => Aa8,
        (Sta06, Evt04) => Aa8,
        (Sta06, Evt06) => Aa8,
        (Sta06, Evt09) => Dt1,
        (Sta06, Evt10) => Dt2,
        (Sta06, Evt11) => Ar1,
        (Sta06, Evt12) => Ar2,
        (Sta06, Evt13) => Aa8,
        (Sta06, Evt15) => Aa1,
        (Sta06, Evt16) => Aa3,
        (Sta06, Evt17) => Aa4,
        (Sta06, Evt19) => Aa8,

        (Sta07, Evt03) => Aa8,
        (Sta07, Evt04) => Aa8,
        (Sta07, Evt06) => Aa8,
        (Sta07, Evt10) => Ar6,
        (Sta07, Evt12) => Ar8,
        (Sta07, Evt13) => Ar3,
        (Sta07, Evt15) => Aa1,
        (Sta07, Evt16) => Aa3,
        (Sta07, Evt17) => Aa4,
        (Sta07, Evt19) => Aa8,

        (Sta08, Evt03) => Aa8,
        (Sta08, Evt04) => Aa8,
        (Sta08, Evt06) => Aa8,
        (Sta08, Evt09) => Ar7,
        (Sta08, Evt10) => Aa8,
        (Sta08, Evt12) => Aa8,
        (Sta08, Evt13) => Aa8,
        (Sta08, Evt14) => Ar4,
        (Sta08, Evt15) => Aa1,
        (Sta08, Evt16) => Aa3,
        (Sta08, Evt17) => Aa4,
        (Sta08, Evt19) => Aa8,

        (Sta09, Evt03) => Aa8,
        (Sta09, Evt04) => Aa8,
        (Sta09, Evt06) => Aa8,
        (Sta09, Evt10) => Aa8,
        (Sta09, Evt12) => Aa8,
        (Sta09, Evt13) => Aa8,
        (Sta09, Evt14) => Ar9,
        (Sta09, Evt15) => Aa1,
        (Sta09, Evt16) => Aa3,
        (Sta09, Evt17) => Aa4,
        (Sta09, Evt19) => Aa8,

        (Sta10, Evt03) => Aa8,
        (Sta10, Evt04) => Aa8,
        (Sta10, Evt06) => Aa8,
        (Sta10, Evt10) => Aa8,
        (Sta10, Evt12) => Aa8,
        (Sta10, Evt13) => Ar10,
        (Sta10, Evt15) => Aa1,
        (Sta10, Evt16) => Aa3,
        (Sta10, Evt17) => Aa4,
        (Sta10, Evt19) => Aa8,

        (Sta11, Evt03) => Aa8,
        (Sta11, Evt04) => Aa8,
        (Sta11, Evt06) => Aa8,
        (Sta11, Evt10) => Aa8,
        (Sta11, Evt12) => Aa8,
        (Sta11, Evt13) => Ar3,
        (Sta11, Evt15) => Aa1,
        (Sta11, Evt16) => Aa3,
        (Sta11, Evt17) => Aa4,
        (Sta11, Evt19) => Aa8,

        (Sta12, Evt03) => Aa8,
        (Sta12, Evt04) => Aa8,
        (Sta12, Evt06) => Aa8,
        (Sta12, Evt10) => Aa8,
        (Sta12, Evt12) => Aa8,
        (Sta12, Evt13) => Aa8,
        (Sta12, Evt14) => Ar4,
        (Sta12, Evt15) => Aa1,
        (Sta12, Evt16) => Aa3,
        (Sta12, Evt17) => Aa4,
        (Sta12, Evt19) => Aa8,

        (Sta13, Evt03) => Aa6,
        (Sta13, Evt04) => Aa6,
        (Sta13, Evt06) => Aa7,
        (Sta13, Evt07) => Aa7,
        (Sta13, Evt08) => Aa7,
        (Sta13, Evt09) => Aa7,
        (Sta13, Evt10) => Aa6,
        (Sta13, Evt11) => Aa6,
        (Sta13, Evt12) => Aa6,
        (Sta13, Evt13) => Aa6,
        (Sta13, Evt14) => Aa6,
        (Sta13, Evt15) => Aa2,
        (Sta13, Evt16) => Aa2,
        (Sta13, Evt17) => Ar5,
        (Sta13, Evt18) => Aa2,
        (Sta13, Evt19) => Aa7,

        // undefined pair: protocol violation
        _ => Aa2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(State::Sta01, Event::Evt01, Action::Ae1)]
    #[case(State::Sta04, Event::Evt02, Action::Ae2)]
    #[case(State::Sta05, Event::Evt03, Action::Ae3)]
    #[case(State::Sta05, Event::Evt04, Action::Ae4)]
    #[case(State::Sta01, Event::Evt05, Action::Ae5)]
    #[case(State::Sta02, Event::Evt06, Action::Ae6)]
    #[case(State::Sta03, Event::Evt07, Action::Ae7)]
    #[case(State::Sta03, Event::Evt08, Action::Ae8)]
    #[case(State::Sta06, Event::Evt09, Action::Dt1)]
    #[case(State::Sta06, Event::Evt10, Action::Dt2)]
    #[case(State::Sta06, Event::Evt11, Action::Ar1)]
    #[case(State::Sta06, Event::Evt12, Action::Ar2)]
    #[case(State::Sta07, Event::Evt10, Action::Ar6)]
    #[case(State::Sta07, Event::Evt12, Action::Ar8)]
    #[case(State::Sta07, Event::Evt13, Action::Ar3)]
    #[case(State::Sta08, Event::Evt09, Action::Ar7)]
    #[case(State::Sta08, Event::Evt14, Action::Ar4)]
    #[case(State::Sta13, Event::Evt17, Action::Ar5)]
    #[case(State::Sta13, Event::Evt18, Action::Aa2)]
    fn key_transitions_match_the_table(
        #[case] state: State,
        #[case] event: Event,
        #[case] action: Action,
    ) {
        assert_eq!(transition(state, event), action);
    }

    #[rstest]
    #[case(State::Sta01, Event::Evt09)]
    #[case(State::Sta02, Event::Evt09)]
    #[case(State::Sta04, Event::Evt10)]
    #[case(State::Sta06, Event::Evt14)]
    fn undefined_pairs_fall_back_to_closing_the_transport(
        #[case] state: State,
        #[case] event: Event,
    ) {
        assert_eq!(transition(state, event), Action::Aa2);
    }

    #[test]
    fn every_pair_resolves_to_an_action() {
        // the match is total by construction; make sure no pair panics
        for state in State::ALL {
            for event in Event::ALL {
                let _ = transition(state, event);
            }
        }
    }

    #[test]
    fn release_collision_rows() {
        // requestor side
        assert_eq!(transition(State::Sta09, Event::Evt14), Action::Ar9);
        assert_eq!(transition(State::Sta11, Event::Evt13), Action::Ar3);
        // acceptor side
        assert_eq!(transition(State::Sta10, Event::Evt13), Action::Ar10);
        assert_eq!(transition(State::Sta12, Event::Evt14), Action::Ar4);
    }

    #[test]
    fn sta13_sinks_inbound_pdus() {
        for event in [Event::Evt03, Event::Evt04, Event::Evt10, Event::Evt12, Event::Evt13] {
            assert_eq!(transition(State::Sta13, event), Action::Aa6);
        }
        for event in [Event::Evt06, Event::Evt07, Event::Evt08, Event::Evt09, Event::Evt19] {
            assert_eq!(transition(State::Sta13, event), Action::Aa7);
        }
    }
}
