//! Typed constructors for common DIMSE-C command sets.
//!
//! These are conveniences for service layers:
//! each one assembles the command group elements of a message
//! and hands back the [`CommandSet`] the engine transports.

use bon::Builder;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::dimse::{
    CommandField, CommandSet, MessageId, Priority, Result, Status, DATA_SET_ABSENT,
    DATA_SET_PRESENT,
};

/// A value which can be rendered as a DIMSE command set.
pub trait Command {
    /// The command field code of this message type.
    fn command_field(&self) -> CommandField;

    /// Build the command group element set of this message.
    fn dataset(&self) -> InMemDicomObject;

    /// Produce the transportable command set.
    fn command_set(&self) -> Result<CommandSet> {
        CommandSet::from_object(self.dataset())
    }
}

/// C-ECHO-RQ (PS3.7 §9.3.5.1)
#[derive(Debug, Builder)]
pub struct CEchoRq<'a> {
    pub message_id: MessageId,
    #[builder(default = dicom_dictionary_std::uids::VERIFICATION)]
    pub affected_sop_class_uid: &'a str,
}

impl Command for CEchoRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRq
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ])
    }
}

/// C-ECHO-RSP (PS3.7 §9.3.5.2)
#[derive(Debug, Builder)]
pub struct CEchoRsp<'a> {
    pub message_id_being_responded_to: MessageId,
    #[builder(default = dicom_dictionary_std::uids::VERIFICATION)]
    pub affected_sop_class_uid: &'a str,
    #[builder(default = Status::SUCCESS)]
    pub status: Status,
}

impl Command for CEchoRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [self.status.code()]),
            ),
        ])
    }
}

/// C-STORE-RQ (PS3.7 §9.3.1.1); a data set always follows.
#[derive(Debug, Builder)]
pub struct CStoreRq<'a> {
    pub message_id: MessageId,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
    pub move_originator_ae_title: Option<&'a str>,
    pub move_originator_message_id: Option<MessageId>,
}

impl Command for CStoreRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRq
    }

    fn dataset(&self) -> InMemDicomObject {
        let mut elements = vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [self.priority as u16]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                self.affected_sop_instance_uid,
            ),
        ];
        if let Some(ae_title) = self.move_originator_ae_title {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                ae_title,
            ));
        }
        if let Some(id) = self.move_originator_message_id {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [id]),
            ));
        }
        InMemDicomObject::command_from_element_iter(elements)
    }
}

/// C-STORE-RSP (PS3.7 §9.3.1.2)
#[derive(Debug, Builder)]
pub struct CStoreRsp<'a> {
    pub message_id_being_responded_to: MessageId,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub status: Status,
}

impl Command for CStoreRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [self.status.code()]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                self.affected_sop_instance_uid,
            ),
        ])
    }
}

/// C-FIND-RQ (PS3.7 §9.3.2.1); the identifier data set always follows.
#[derive(Debug, Builder)]
pub struct CFindRq<'a> {
    pub message_id: MessageId,
    pub affected_sop_class_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
}

impl Command for CFindRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRq
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [self.priority as u16]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
        ])
    }
}

/// C-FIND-RSP (PS3.7 §9.3.2.2).
/// Pending responses carry a match in the data set channel.
#[derive(Debug, Builder)]
pub struct CFindRsp<'a> {
    pub message_id_being_responded_to: MessageId,
    pub affected_sop_class_uid: &'a str,
    pub status: Status,
    /// Whether an identifier data set follows; pending responses carry one.
    #[builder(default = false)]
    pub has_data: bool,
}

impl Command for CFindRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        let data_set_type = if self.has_data {
            DATA_SET_PRESENT
        } else {
            DATA_SET_ABSENT
        };
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                self.affected_sop_class_uid,
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field().code()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [data_set_type]),
            ),
            DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [self.status.code()]),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_rq_builds_a_complete_command_set() {
        let cmd = CEchoRq::builder().message_id(1).build().command_set().unwrap();
        assert_eq!(cmd.command_field(), CommandField::CEchoRq);
        assert_eq!(cmd.message_id(), 1);
        assert!(!cmd.has_data());
    }

    #[test]
    fn echo_rsp_carries_status_and_responded_id() {
        let cmd = CEchoRsp::builder()
            .message_id_being_responded_to(42)
            .build()
            .command_set()
            .unwrap();
        assert_eq!(cmd.command_field(), CommandField::CEchoRsp);
        assert_eq!(cmd.message_id(), 42);
        assert_eq!(cmd.status(), Some(Status::SUCCESS));
    }

    #[test]
    fn store_rq_expects_a_data_set() {
        let cmd = CStoreRq::builder()
            .message_id(7)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .affected_sop_instance_uid("2.25.145")
            .build()
            .command_set()
            .unwrap();
        assert_eq!(cmd.command_field(), CommandField::CStoreRq);
        assert!(cmd.has_data());
    }

    #[test]
    fn find_rsp_pending_keeps_the_data_channel_open() {
        let pending = CFindRsp::builder()
            .message_id_being_responded_to(3)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.1")
            .status(Status::PENDING)
            .has_data(true)
            .build()
            .command_set()
            .unwrap();
        assert!(pending.has_data());
        assert!(pending.status().unwrap().is_pending());

        let done = CFindRsp::builder()
            .message_id_being_responded_to(3)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.1")
            .status(Status::SUCCESS)
            .build()
            .command_set()
            .unwrap();
        assert!(!done.has_data());
    }
}
