//! Association management for DICOM nodes.
//!
//! Each association runs its own protocol machine on a dedicated thread.
//! The service layer talks to it through two channels:
//! *downcalls* (requests to send a message, release or abort),
//! issued through the [`Association`] handle,
//! and *upcalls* ([`Upcall`]), received from the handle.
//! The upcall channel closing signals the end of the association:
//! before a [`Upcall::HandshakeCompleted`] it means the association
//! failed to establish, afterwards it means the session is over.
//!
//! The requestor side is configured with [`RequestorOptions`]
//! and the acceptor side with [`AcceptorOptions`];
//! both take an already-connected TCP stream.

pub mod context;

use std::net::TcpStream;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use snafu::{Backtrace, ResultExt, Snafu};

use crate::dimse::CommandSet;
use crate::machine::{
    DimsePayload, Event, MachineOptions, StateEvent, StateMachine, DEFAULT_ARTIM_TIMEOUT,
};
use crate::pdu::{AssociationAC, AssociationRJ, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE};

pub use context::{ContextManager, NegotiationError, PresentationContext};

/// The UID of the standard DICOM application context.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Capacity of the event and upcall queues of one association.
const CHANNEL_CAPACITY: usize = 128;

/// An indication surfaced by the protocol machine to the service layer.
#[derive(Debug)]
pub enum Upcall {
    /// The association handshake concluded successfully,
    /// on either side of it.
    HandshakeCompleted {
        /// the accepted presentation contexts, in context ID order
        contexts: Vec<PresentationContext>,
        /// the maximum PDU length admitted by the peer
        peer_max_pdu_length: u32,
    },
    /// A DIMSE message was fully reassembled.
    Data {
        context_id: u8,
        command: CommandSet,
        data: Vec<u8>,
    },
}

/// An error which may occur when operating an association handle.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The protocol machine has already terminated.
    #[snafu(display("the association engine has terminated"))]
    Terminated { backtrace: Backtrace },

    #[snafu(display("could not spawn the association thread: {}", source))]
    SpawnThread {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration of an association on the requestor side,
/// usually a service class user.
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::association::RequestorOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = std::net::TcpStream::connect("192.168.0.5:104")?;
/// let association = RequestorOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("MAIN-STORAGE")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .spawn(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RequestorOptions {
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    abstract_syntaxes: Vec<String>,
    transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    read_max_pdu_length: u32,
    artim_timeout: Duration,
}

impl Default for RequestorOptions {
    fn default() -> Self {
        RequestorOptions {
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()],
            max_pdu_length: DEFAULT_MAX_PDU,
            read_max_pdu_length: MAXIMUM_PDU_SIZE,
            artim_timeout: DEFAULT_ARTIM_TIMEOUT,
        }
    }
}

impl RequestorOptions {
    pub fn new() -> Self {
        RequestorOptions::default()
    }

    /// Set the calling AE title (this node).
    pub fn calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.calling_ae_title = ae_title.into();
        self
    }

    /// Set the called AE title (the peer node).
    pub fn called_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.called_ae_title = ae_title.into();
        self
    }

    /// Propose one more abstract syntax.
    pub fn with_abstract_syntax(mut self, uid: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(uid.into());
        self
    }

    /// Replace the set of transfer syntaxes offered for every context.
    pub fn transfer_syntaxes(
        mut self,
        uids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.transfer_syntaxes = uids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum PDU length advertised to the peer.
    pub fn max_pdu_length(mut self, length: u32) -> Self {
        self.max_pdu_length = length;
        self
    }

    /// Set the largest PDU length admitted from the wire.
    pub fn read_max_pdu_length(mut self, length: u32) -> Self {
        self.read_max_pdu_length = length;
        self
    }

    /// Set the ARTIM timer interval.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim_timeout = timeout;
        self
    }

    /// Start the protocol machine over the given connected stream
    /// and request the association.
    ///
    /// Establishment is reported asynchronously through
    /// [`Upcall::HandshakeCompleted`].
    pub fn spawn(self, stream: TcpStream) -> Result<Association> {
        let label = format!("requestor {}", self.calling_ae_title);
        let options = MachineOptions {
            label,
            requestor: true,
            calling_ae_title: self.calling_ae_title,
            called_ae_title: self.called_ae_title,
            application_context_name: self.application_context_name,
            abstract_syntaxes: self.abstract_syntaxes,
            transfer_syntaxes: self.transfer_syntaxes,
            max_pdu_length: self.max_pdu_length,
            read_max_pdu_length: self.read_max_pdu_length,
            artim_timeout: self.artim_timeout,
        };
        // evt01 starts the machine; the opened transport follows as evt02
        spawn_machine(options, StateEvent::new(Event::Evt01), |events| {
            events
                .send(StateEvent::with_conn(Event::Evt02, stream))
                .ok();
        })
    }
}

/// Configuration of an association on the acceptor side,
/// usually a service class provider.
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::association::AcceptorOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = std::net::TcpListener::bind("0.0.0.0:104")?;
/// let (stream, _peer) = listener.accept()?;
/// let association = AcceptorOptions::new()
///     .ae_title("STORE-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .spawn(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    ae_title: String,
    abstract_syntaxes: Vec<String>,
    transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    read_max_pdu_length: u32,
    artim_timeout: Duration,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        AcceptorOptions {
            ae_title: "THIS-SCP".to_string(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()],
            max_pdu_length: DEFAULT_MAX_PDU,
            read_max_pdu_length: MAXIMUM_PDU_SIZE,
            artim_timeout: DEFAULT_ARTIM_TIMEOUT,
        }
    }
}

impl AcceptorOptions {
    pub fn new() -> Self {
        AcceptorOptions::default()
    }

    /// Set the AE title of this node.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.ae_title = ae_title.into();
        self
    }

    /// Accept one more abstract syntax.
    pub fn with_abstract_syntax(mut self, uid: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(uid.into());
        self
    }

    /// Replace the set of transfer syntaxes accepted for any context.
    pub fn transfer_syntaxes(
        mut self,
        uids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.transfer_syntaxes = uids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum PDU length advertised to the peer.
    pub fn max_pdu_length(mut self, length: u32) -> Self {
        self.max_pdu_length = length;
        self
    }

    /// Set the largest PDU length admitted from the wire.
    pub fn read_max_pdu_length(mut self, length: u32) -> Self {
        self.read_max_pdu_length = length;
        self
    }

    /// Set the ARTIM timer interval.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim_timeout = timeout;
        self
    }

    /// Start the protocol machine over an accepted stream.
    ///
    /// Negotiation happens automatically against the configured
    /// abstract and transfer syntaxes; the outcome is reported through
    /// [`Upcall::HandshakeCompleted`] or by the upcall channel closing.
    pub fn spawn(self, stream: TcpStream) -> Result<Association> {
        let label = format!("acceptor {}", self.ae_title);
        let options = MachineOptions {
            label,
            requestor: false,
            calling_ae_title: self.ae_title.clone(),
            called_ae_title: self.ae_title,
            abstract_syntaxes: self.abstract_syntaxes,
            transfer_syntaxes: self.transfer_syntaxes,
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            max_pdu_length: self.max_pdu_length,
            read_max_pdu_length: self.read_max_pdu_length,
            artim_timeout: self.artim_timeout,
        };
        spawn_machine(options, StateEvent::with_conn(Event::Evt05, stream), |_| {})
    }
}

fn spawn_machine(
    options: MachineOptions,
    initial: StateEvent,
    prime: impl FnOnce(&SyncSender<StateEvent>),
) -> Result<Association> {
    let (events_tx, events_rx) = sync_channel(CHANNEL_CAPACITY);
    let (upcalls_tx, upcalls_rx) = sync_channel(CHANNEL_CAPACITY);
    let machine = StateMachine::new(options, events_rx, events_tx.clone(), upcalls_tx);
    prime(&events_tx);

    let thread = std::thread::Builder::new()
        .name("dul-association".to_string())
        .spawn(move || machine.run(initial))
        .context(SpawnThreadSnafu)?;

    Ok(Association {
        events: events_tx,
        upcalls: upcalls_rx,
        thread: Some(thread),
    })
}

/// A handle over one association.
///
/// Dropping the handle requests an abort;
/// ending the association gracefully is done with
/// [`release`](Association::release) followed by draining the upcalls.
#[derive(Debug)]
pub struct Association {
    events: SyncSender<StateEvent>,
    upcalls: Receiver<Upcall>,
    thread: Option<JoinHandle<()>>,
}

impl Association {
    /// The stream of indications from the protocol machine.
    pub fn upcalls(&self) -> &Receiver<Upcall> {
        &self.upcalls
    }

    /// Receive the next indication,
    /// or `None` once the association has ended.
    pub fn recv(&self) -> Option<Upcall> {
        self.upcalls.recv().ok()
    }

    /// Send one DIMSE message over the association.
    ///
    /// `data` must be empty unless the command set announces a data set.
    pub fn send_dimse(
        &self,
        abstract_syntax_uid: impl Into<String>,
        command: CommandSet,
        data: Vec<u8>,
    ) -> Result<()> {
        self.post(StateEvent::with_payload(
            Event::Evt09,
            DimsePayload {
                abstract_syntax_uid: abstract_syntax_uid.into(),
                command,
                data,
            },
        ))
    }

    /// Request a graceful release of the association.
    pub fn release(&self) -> Result<()> {
        self.post(StateEvent::new(Event::Evt11))
    }

    /// Abort the association.
    pub fn abort(&self) -> Result<()> {
        self.post(StateEvent::new(Event::Evt15))
    }

    /// Answer an association request with the given acceptance.
    ///
    /// Only meaningful for service classes which drive the
    /// negotiation themselves; the machine normally accepts on its own.
    pub fn accept(&self, response: AssociationAC) -> Result<()> {
        self.post(StateEvent::with_pdu(
            Event::Evt07,
            crate::pdu::Pdu::AssociationAC(response),
        ))
    }

    /// Answer an association request with the given rejection.
    pub fn reject(&self, rejection: AssociationRJ) -> Result<()> {
        self.post(StateEvent::with_pdu(
            Event::Evt08,
            crate::pdu::Pdu::AssociationRJ(rejection),
        ))
    }

    /// Wait for the protocol machine to terminate.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn post(&self, event: StateEvent) -> Result<()> {
        self.events.send(event).map_err(|_| TerminatedSnafu.build())
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        // best effort: ask the machine to abort whatever remains.
        // a full queue means the machine is busy tearing down already
        let _ = self.events.try_send(StateEvent::new(Event::Evt15));
    }
}
