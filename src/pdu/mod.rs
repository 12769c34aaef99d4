//! Protocol data unit types of the DICOM upper layer protocol,
//! as defined in PS3.8 §9.3,
//! plus the blocking encoder and decoder for them.
//!
//! A PDU on the wire is a 6-byte header
//! (type, reserved byte, big endian u32 length)
//! followed by exactly `length` bytes of payload.
//! [`read_pdu`] and [`write_pdu`] convert between that framing
//! and the [`Pdu`] data type.

pub mod reader;
pub mod writer;


pub use reader::read_pdu;
pub use writer::write_pdu;

/// The protocol version supported by this implementation (bit 0 set).
pub const CURRENT_PROTOCOL_VERSION: u16 = 0x0001;

/// The default maximum PDU length advertised to peers,
/// via the Maximum Length sub-item.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The smallest maximum PDU length that a reader will accept to enforce.
pub const MINIMUM_PDU_SIZE: u32 = 16_384;

/// The largest PDU length that a reader will ever admit from the wire.
pub const MAXIMUM_PDU_SIZE: u32 = 16 * 1024 * 1024;

/// The number of bytes of the fixed PDU header:
/// PDU-type, reserved byte, and the 4-byte PDU-length field.
pub const PDU_HEADER_SIZE: u32 = 6;

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (PDU-type 01H)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (PDU-type 02H)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (PDU-type 03H)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (PDU-type 04H)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (PDU-type 05H)
    ReleaseRQ,
    /// A-RELEASE-RP (PDU-type 06H)
    ReleaseRP,
    /// A-ABORT (PDU-type 07H)
    AbortRQ { source: AbortRQSource },
    /// A PDU of an unrecognized type, retained as raw payload
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short description of the PDU variant, for log records.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "unknown PDU",
        }
    }
}

/// An association request.
///
/// AE titles are carried without the space padding
/// imposed by the wire format.
/// The writer refuses empty AE titles,
/// since a value of 16 spaces is reserved by the standard.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An association acceptance, mirroring the fields of the request.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An association rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax offered under one or more transfer syntaxes.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextProposed {
    /// odd integer between 1 and 255, chosen by the requestor
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// The acceptor's verdict on one proposed presentation context,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    /// Only significant when `reason` is `Acceptance`.
    pub transfer_syntax: String,
}

/// The Result/Reason field of a presentation context reply (PS3.8 §9.3.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Association rejection Result field (PS3.8 Table 9-21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Association rejection Source and Reason/Diag fields (PS3.8 Table 9-21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, n @ (4..=6 | 8..=10)) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(n),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, n @ (0 | 3..=7)) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(n),
            )),
            _ => None,
        }
    }

    /// The `(source, reason)` byte pair of this value.
    pub fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let r = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(n) => n,
                };
                (1, r)
            }
            AssociationRJSource::ServiceProviderAcse(reason) => {
                let r = match reason {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                };
                (2, r)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let r = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(n) => n,
                };
                (3, r)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value item of a P-DATA-TF PDU:
/// one fragment of either the command set or the data set
/// of a DIMSE message, in a given presentation context.
#[derive(Debug, Clone, PartialEq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its channel
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value carries
/// command set or data set bytes (message control header, bit 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The Source and Reason/Diag fields of an A-ABORT PDU (PS3.8 Table 9-26).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQSource {
    ServiceUser,
    Reserved,
    ServiceProvider(AbortRQServiceProviderReason),
}

impl AbortRQSource {
    pub fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(AbortRQSource::ServiceUser),
            1 => Some(AbortRQSource::Reserved),
            2 => AbortRQServiceProviderReason::from_code(reason)
                .map(AbortRQSource::ServiceProvider),
            _ => None,
        }
    }

    /// The `(source, reason)` byte pair of this value.
    /// The reason is not significant for user initiated aborts
    /// and is emitted as zero.
    pub fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => (2, reason as u8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified = 0,
    UnrecognizedPdu = 1,
    UnexpectedPdu = 2,
    Reserved = 3,
    UnrecognizedPduParameter = 4,
    UnexpectedPduParameter = 5,
    InvalidPduParameter = 6,
}

impl AbortRQServiceProviderReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AbortRQServiceProviderReason::ReasonNotSpecified),
            1 => Some(AbortRQServiceProviderReason::UnrecognizedPdu),
            2 => Some(AbortRQServiceProviderReason::UnexpectedPdu),
            3 => Some(AbortRQServiceProviderReason::Reserved),
            4 => Some(AbortRQServiceProviderReason::UnrecognizedPduParameter),
            5 => Some(AbortRQServiceProviderReason::UnexpectedPduParameter),
            6 => Some(AbortRQServiceProviderReason::InvalidPduParameter),
            _ => None,
        }
    }
}

/// A sub-item of the User Information item (PS3.8 Annex D).
#[derive(Debug, Clone, PartialEq)]
pub enum UserVariableItem {
    /// Maximum Length sub-item (51H): the largest P-DATA-TF PDU
    /// the emitting entity is willing to receive. Zero means unlimited.
    MaxLength(u32),
    /// Implementation Class UID sub-item (52H)
    ImplementationClassUID(String),
    /// Implementation Version Name sub-item (55H)
    ImplementationVersionName(String),
    /// Asynchronous Operations Window sub-item (53H):
    /// maximum number of operations invoked and performed.
    AsynchronousOperationsWindow(u16, u16),
    /// SCP/SCU Role Selection sub-item (54H)
    RoleSelection {
        sop_class_uid: String,
        scu_role: u8,
        scp_role: u8,
    },
    /// Any other sub-item, retained as raw payload.
    Unknown(u8, Vec<u8>),
}

/// A variable item of an A-ASSOCIATE-RQ/AC PDU,
/// produced while walking the variable field.
#[derive(Debug)]
pub(crate) enum PduVariableItem {
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
    Unknown(u8),
}
