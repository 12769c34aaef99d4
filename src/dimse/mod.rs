//! DIMSE message support for the upper layer engine.
//!
//! The engine does not interpret service semantics:
//! a DIMSE message is moved around as a [`CommandSet`]
//! (the decoded command group elements plus the fields
//! every service shares) and an opaque data set payload.
//! Command sets are always encoded in Implicit VR Little Endian
//! (PS3.7 §6.3.1), with a leading Command Group Length element.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

pub mod assembler;
pub mod commands;

pub use assembler::{fragment_into_pdus, AssemblyError, CommandAssembler, FragmentationError};

/// An identifier of a DIMSE message within an association.
pub type MessageId = u16;

/// Value of the Command Data Set Type element (0000,0800)
/// which signals that no data set follows the command set.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// Any other Command Data Set Type value signals a data set;
/// this is the conventional one.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// An error which may occur
/// when encoding or decoding a DIMSE command set.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MessageError {
    #[snafu(display("could not read command set elements: {}", source))]
    ReadCommandSet { source: dicom_object::ReadError },

    #[snafu(display("could not write command set elements: {}", source))]
    WriteCommandSet { source: dicom_object::WriteError },

    #[snafu(display("missing required command element `{}`", name))]
    MissingElement {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value in command element `{}`: {}", name, source))]
    InvalidElementValue {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unknown DIMSE command field {:#06x}", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// The Command Field values of the DIMSE-C services (PS3.7 Annex E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this command field identifies a response message.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

/// The priority of a DIMSE request (0000,0700).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// A DIMSE response status code (PS3.7 Annex C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const CANCEL: Status = Status(0xFE00);
    pub const PENDING: Status = Status(0xFF00);
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0112);
    pub const INVALID_ARGUMENT_VALUE: Status = Status(0x0115);
    pub const INVALID_ATTRIBUTE_VALUE: Status = Status(0x0106);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const NOT_AUTHORIZED: Status = Status(0x0124);

    // C-STORE specifics, PS3.4 GG.4-1
    pub const STORE_OUT_OF_RESOURCES: Status = Status(0xA700);
    pub const STORE_CANNOT_UNDERSTAND: Status = Status(0xC000);
    pub const STORE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: Status = Status(0xA900);

    // C-MOVE/C-GET specifics
    pub const MOVE_DESTINATION_UNKNOWN: Status = Status(0xA801);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_pending(self) -> bool {
        matches!(self.0, 0xFF00 | 0xFF01)
    }

    pub fn is_cancel(self) -> bool {
        self.0 == 0xFE00
    }

    pub fn is_warning(self) -> bool {
        matches!(self.0, 0x0001 | 0x0107 | 0x0116) || (0xB000..=0xBFFF).contains(&self.0)
    }
}

/// The command set of one DIMSE message.
///
/// Wraps the decoded command group elements
/// together with the fields which the engine itself needs:
/// the command field, the message identifier,
/// the data set presence marker and the response status.
/// Everything else stays available through [`CommandSet::object`].
#[derive(Debug, Clone)]
pub struct CommandSet {
    object: InMemDicomObject,
    command_field: CommandField,
    message_id: MessageId,
    data_set_type: u16,
    status: Option<Status>,
}

impl CommandSet {
    /// Interpret a decoded element set as a DIMSE command set.
    pub fn from_object(object: InMemDicomObject) -> Result<Self> {
        let code = require_u16(&object, tags::COMMAND_FIELD, "CommandField")?;
        let command_field =
            CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })?;

        // responses identify themselves through the message ID
        // of the request being responded to
        let message_id = if command_field.is_response() {
            require_u16(
                &object,
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                "MessageIDBeingRespondedTo",
            )?
        } else {
            require_u16(&object, tags::MESSAGE_ID, "MessageID")?
        };

        let data_set_type =
            optional_u16(&object, tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType")?
                .unwrap_or(DATA_SET_ABSENT);
        let status = optional_u16(&object, tags::STATUS, "Status")?.map(Status);

        Ok(CommandSet {
            object,
            command_field,
            message_id,
            data_set_type,
            status,
        })
    }

    /// Decode a command set from its wire form
    /// (Implicit VR Little Endian command group encoding).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let object =
            InMemDicomObject::read_dataset_with_ts(data, &ts).context(ReadCommandSetSnafu)?;
        CommandSet::from_object(object)
    }

    /// Encode the command set into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut data = Vec::new();
        self.object
            .write_dataset_with_ts(&mut data, &ts)
            .context(WriteCommandSetSnafu)?;
        Ok(data)
    }

    pub fn command_field(&self) -> CommandField {
        self.command_field
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Whether a data set follows this command set on the association.
    pub fn has_data(&self) -> bool {
        self.data_set_type != DATA_SET_ABSENT
    }

    /// The response status, present in response messages only.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// The full command group element set.
    pub fn object(&self) -> &InMemDicomObject {
        &self.object
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.object
    }
}

fn require_u16(object: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16> {
    object
        .element(tag)
        .ok()
        .context(MissingElementSnafu { name })?
        .to_int::<u16>()
        .context(InvalidElementValueSnafu { name })
}

fn optional_u16(object: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Option<u16>> {
    match object.element(tag) {
        Ok(element) => element
            .to_int::<u16>()
            .map(Some)
            .context(InvalidElementValueSnafu { name }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::uids;

    fn echo_rq_object(message_id: u16) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uids::VERIFICATION),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ])
    }

    #[test]
    fn command_set_roundtrip() {
        let cmd = CommandSet::from_object(echo_rq_object(5)).unwrap();
        assert_eq!(cmd.command_field(), CommandField::CEchoRq);
        assert_eq!(cmd.message_id(), 5);
        assert!(!cmd.has_data());
        assert_eq!(cmd.status(), None);

        let encoded = cmd.encode().unwrap();
        let decoded = CommandSet::decode(&encoded).unwrap();
        assert_eq!(decoded.command_field(), CommandField::CEchoRq);
        assert_eq!(decoded.message_id(), 5);
        assert!(!decoded.has_data());
    }

    #[test]
    fn response_message_id_comes_from_responded_to() {
        let object = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [9]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
        ]);
        let cmd = CommandSet::from_object(object).unwrap();
        assert_eq!(cmd.command_field(), CommandField::CEchoRsp);
        assert_eq!(cmd.message_id(), 9);
        assert_eq!(cmd.status(), Some(Status::SUCCESS));
        assert!(cmd.status().unwrap().is_success());
    }

    #[test]
    fn unknown_command_field_is_rejected() {
        let object = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x4242])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
        ]);
        assert!(matches!(
            CommandSet::from_object(object),
            Err(MessageError::UnknownCommandField { code: 0x4242, .. })
        ));
    }

    #[test]
    fn status_classification() {
        assert!(Status::SUCCESS.is_success());
        assert!(Status::PENDING.is_pending());
        assert!(Status::PENDING_WARNING.is_pending());
        assert!(Status::CANCEL.is_cancel());
        assert!(Status(0xB007).is_warning());
        assert!(!Status::STORE_CANNOT_UNDERSTAND.is_success());
    }
}
