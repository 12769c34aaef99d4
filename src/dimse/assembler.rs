//! Fragmentation of outbound DIMSE byte streams into P-DATA-TF PDUs
//! and reassembly of inbound fragments into whole messages.
//!
//! Fragments of the command set and of the data set travel
//! on separate channels of the same presentation context,
//! told apart by the command bit of the message control header.
//! Each channel is terminated by exactly one fragment
//! with the last bit set.

use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::dimse::{CommandSet, MessageError};
use crate::pdu::{PDataValue, PDataValueType, Pdu};

/// Overhead in bytes of a P-DATA-TF PDU around a single fragment:
/// the PDU header plus the PDV item length, context ID
/// and message control header.
const FRAGMENT_OVERHEAD: u32 = 8;

/// An error which may occur when fragmenting an outbound message.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FragmentationError {
    #[snafu(display(
        "cannot fragment for a maximum PDU length of {}",
        max_pdu_length
    ))]
    MaxPduTooSmall {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
}

/// An error which may occur while assembling inbound fragments.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AssemblyError {
    #[snafu(display(
        "presentation context mismatch within one message: {} then {}",
        expected,
        got
    ))]
    MixedContext {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("more than one command fragment with the last bit set"))]
    DuplicateCommandLast { backtrace: Backtrace },

    #[snafu(display("more than one data fragment with the last bit set"))]
    DuplicateDataLast { backtrace: Backtrace },

    #[snafu(display("could not decode command set: {}", source))]
    DecodeCommand {
        #[snafu(backtrace)]
        source: MessageError,
    },
}

/// Split one channel of a DIMSE message into P-DATA-TF PDUs.
///
/// Every produced PDU carries a single presentation data value
/// of at most `max_pdu_length - 8` bytes,
/// so that its total length on the wire never exceeds `max_pdu_length`.
/// Only the final fragment has the last bit set.
pub fn fragment_into_pdus(
    presentation_context_id: u8,
    max_pdu_length: u32,
    value_type: PDataValueType,
    data: &[u8],
) -> Result<Vec<Pdu>, FragmentationError> {
    ensure!(
        max_pdu_length > FRAGMENT_OVERHEAD,
        MaxPduTooSmallSnafu { max_pdu_length }
    );
    let chunk_size = (max_pdu_length - FRAGMENT_OVERHEAD) as usize;

    if data.is_empty() {
        return Ok(vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: vec![],
            }],
        }]);
    }

    let mut pdus: Vec<Pdu> = data
        .chunks(chunk_size)
        .map(|chunk| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: false,
                data: chunk.to_vec(),
            }],
        })
        .collect();
    if let Some(Pdu::PData { data }) = pdus.last_mut() {
        data[0].is_last = true;
    }
    Ok(pdus)
}

/// Reassembles one DIMSE message from inbound P-DATA-TF fragments.
///
/// Feed every received P-DATA-TF into [`add`](CommandAssembler::add).
/// Once the command channel is complete the command set is decoded;
/// the assembly finishes when the data channel is also complete,
/// or right away for messages without a data set.
/// The assembler resets itself upon completion.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
    command_complete: bool,
    data_complete: bool,
    command: Option<CommandSet>,
}

impl CommandAssembler {
    /// Add the presentation data values of one P-DATA-TF PDU.
    ///
    /// Returns the completed message as
    /// `(presentation context ID, command set, data set bytes)`
    /// once all fragments have arrived, and `None` while more are needed.
    pub fn add(
        &mut self,
        values: &[PDataValue],
    ) -> Result<Option<(u8, CommandSet, Vec<u8>)>, AssemblyError> {
        for pdv in values {
            match self.presentation_context_id {
                None => self.presentation_context_id = Some(pdv.presentation_context_id),
                Some(expected) => ensure!(
                    expected == pdv.presentation_context_id,
                    MixedContextSnafu {
                        expected,
                        got: pdv.presentation_context_id
                    }
                ),
            }
            match pdv.value_type {
                PDataValueType::Command => {
                    self.command_bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        ensure!(!self.command_complete, DuplicateCommandLastSnafu);
                        self.command_complete = true;
                    }
                }
                PDataValueType::Data => {
                    self.data_bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        ensure!(!self.data_complete, DuplicateDataLastSnafu);
                        self.data_complete = true;
                    }
                }
            }
        }

        if !self.command_complete {
            return Ok(None);
        }

        if self.command.is_none() {
            self.command = Some(self.decode_command()?);
        }

        let wants_data = match &self.command {
            Some(command) => command.has_data(),
            None => return Ok(None),
        };
        if wants_data && !self.data_complete {
            return Ok(None);
        }

        let state = std::mem::take(self);
        let context_id = state.presentation_context_id.unwrap_or_default();
        match state.command {
            Some(command) => Ok(Some((context_id, command, state.data_bytes))),
            None => Ok(None),
        }
    }

    #[cfg(not(feature = "compat-partial-command"))]
    fn decode_command(&self) -> Result<CommandSet, AssemblyError> {
        CommandSet::decode(&self.command_bytes).context(DecodeCommandSnafu)
    }

    /// Decode the command set, falling back to a minimal interpretation
    /// for undersized command sets which some peers emit.
    #[cfg(feature = "compat-partial-command")]
    fn decode_command(&self) -> Result<CommandSet, AssemblyError> {
        match CommandSet::decode(&self.command_bytes) {
            Ok(command) => Ok(command),
            Err(e) if self.command_bytes.len() < 100 => {
                match compat::rescue_minimal_command(&self.command_bytes) {
                    Some(command) => {
                        tracing::warn!(
                            "undersized command set could not be fully parsed, \
                             falling back to a minimal interpretation"
                        );
                        Ok(command)
                    }
                    None => Err(e).context(DecodeCommandSnafu),
                }
            }
            Err(e) => Err(e).context(DecodeCommandSnafu),
        }
    }
}

#[cfg(feature = "compat-partial-command")]
mod compat {
    use dicom_core::{dicom_value, DataElement, Tag, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;

    use crate::dimse::{CommandSet, DATA_SET_ABSENT};

    /// Best-effort scan of the raw command bytes
    /// as a sequence of implicit VR little endian elements,
    /// picking out command field, message ID and priority.
    pub(super) fn rescue_minimal_command(raw: &[u8]) -> Option<CommandSet> {
        let mut command_field: Option<u16> = None;
        let mut message_id: u16 = 1;
        let mut priority: u16 = 0x0101;

        let mut rest = raw;
        while rest.len() >= 8 {
            let group = u16::from_le_bytes([rest[0], rest[1]]);
            let element = u16::from_le_bytes([rest[2], rest[3]]);
            let length = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            rest = &rest[8..];
            if rest.len() < length {
                break;
            }
            let value = &rest[..length];
            rest = &rest[length..];

            if length >= 2 {
                let v = u16::from_le_bytes([value[0], value[1]]);
                match Tag(group, element) {
                    tags::COMMAND_FIELD => command_field = Some(v),
                    tags::MESSAGE_ID => message_id = v,
                    tags::PRIORITY => priority = v,
                    _ => {}
                }
            }
        }

        let command_field = command_field?;
        CommandSet::from_object(InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [command_field]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ]))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::commands::{CEchoRq, CStoreRq, Command};
    use crate::dimse::CommandField;
    use crate::pdu::write_pdu;

    fn pdv(context_id: u8, value_type: PDataValueType, is_last: bool, data: &[u8]) -> PDataValue {
        PDataValue {
            presentation_context_id: context_id,
            value_type,
            is_last,
            data: data.to_vec(),
        }
    }

    #[test]
    fn fragments_honor_the_maximum_pdu_length() {
        let payload = vec![0x55u8; 100_000];
        let pdus = fragment_into_pdus(1, 16_384, PDataValueType::Data, &payload).unwrap();
        assert_eq!(pdus.len(), 7);

        for (i, pdu) in pdus.iter().enumerate() {
            let mut bytes = Vec::new();
            write_pdu(&mut bytes, pdu).unwrap();
            // 6-byte header, then at most max_pdu_length bytes
            assert!(bytes.len() - 6 <= 16_384);
            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data.len(), 1);
                    assert_eq!(data[0].is_last, i == 6);
                }
                other => panic!("unexpected PDU {:?}", other),
            }
        }
    }

    #[test]
    fn fragment_sizes_add_up() {
        let payload = vec![1u8; 100_000];
        let pdus = fragment_into_pdus(3, 16_384, PDataValueType::Data, &payload).unwrap();
        let total: usize = pdus
            .iter()
            .map(|pdu| match pdu {
                Pdu::PData { data } => data[0].data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 100_000);
    }

    #[test]
    fn refuses_tiny_maximum_pdu_lengths() {
        assert!(matches!(
            fragment_into_pdus(1, 0, PDataValueType::Command, &[1, 2, 3]),
            Err(FragmentationError::MaxPduTooSmall { .. })
        ));
        assert!(matches!(
            fragment_into_pdus(1, 8, PDataValueType::Command, &[1, 2, 3]),
            Err(FragmentationError::MaxPduTooSmall { .. })
        ));
    }

    #[test]
    fn assembles_a_fragmented_message_with_data() {
        let command = CStoreRq::builder()
            .message_id(2)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .affected_sop_instance_uid("2.25.900")
            .build()
            .command_set()
            .unwrap();
        let command_bytes = command.encode().unwrap();
        let payload = (0..50_000u32).map(|i| i as u8).collect::<Vec<_>>();

        let mut assembler = CommandAssembler::default();
        let mut outcome = None;

        // command channel first, then the data channel, small fragments
        for pdu in fragment_into_pdus(5, 4_096, PDataValueType::Command, &command_bytes)
            .unwrap()
            .into_iter()
            .chain(fragment_into_pdus(5, 4_096, PDataValueType::Data, &payload).unwrap())
        {
            let values = match pdu {
                Pdu::PData { data } => data,
                other => panic!("unexpected PDU {:?}", other),
            };
            if let Some(done) = assembler.add(&values).unwrap() {
                outcome = Some(done);
            }
        }

        let (context_id, message, data) = outcome.expect("message should have completed");
        assert_eq!(context_id, 5);
        assert_eq!(message.command_field(), CommandField::CStoreRq);
        assert_eq!(message.message_id(), 2);
        assert!(message.has_data());
        assert_eq!(data, payload);
    }

    #[test]
    fn completes_without_data_when_none_is_announced() {
        let command = CEchoRq::builder().message_id(1).build().command_set().unwrap();
        let bytes = command.encode().unwrap();

        let mut assembler = CommandAssembler::default();
        let done = assembler
            .add(&[pdv(1, PDataValueType::Command, true, &bytes)])
            .unwrap()
            .expect("echo has no data set");
        assert_eq!(done.0, 1);
        assert_eq!(done.1.command_field(), CommandField::CEchoRq);
        assert!(done.2.is_empty());

        // the assembler must be reusable after completion
        let done = assembler
            .add(&[pdv(1, PDataValueType::Command, true, &bytes)])
            .unwrap();
        assert!(done.is_some());
    }

    #[test]
    fn rejects_mixed_presentation_contexts() {
        let mut assembler = CommandAssembler::default();
        let values = [
            pdv(1, PDataValueType::Command, false, &[0]),
            pdv(3, PDataValueType::Command, true, &[0]),
        ];
        assert!(matches!(
            assembler.add(&values),
            Err(AssemblyError::MixedContext {
                expected: 1,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn rejects_duplicate_last_fragments() {
        let mut assembler = CommandAssembler::default();
        let values = [
            pdv(1, PDataValueType::Command, true, &[0]),
            pdv(1, PDataValueType::Command, true, &[0]),
        ];
        assert!(matches!(
            assembler.add(&values),
            Err(AssemblyError::DuplicateCommandLast { .. })
        ));

        let mut assembler = CommandAssembler::default();
        let values = [
            pdv(1, PDataValueType::Data, true, &[0]),
            pdv(1, PDataValueType::Data, true, &[0]),
        ];
        assert!(matches!(
            assembler.add(&values),
            Err(AssemblyError::DuplicateDataLast { .. })
        ));
    }

    #[test]
    fn incomplete_channels_keep_waiting() {
        let command = CStoreRq::builder()
            .message_id(9)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .affected_sop_instance_uid("2.25.901")
            .build()
            .command_set()
            .unwrap();
        let bytes = command.encode().unwrap();

        let mut assembler = CommandAssembler::default();
        // command is complete but a data set was announced
        assert!(assembler
            .add(&[pdv(1, PDataValueType::Command, true, &bytes)])
            .unwrap()
            .is_none());
        // data arrives in two fragments
        assert!(assembler
            .add(&[pdv(1, PDataValueType::Data, false, &[1, 2])])
            .unwrap()
            .is_none());
        let (_, _, data) = assembler
            .add(&[pdv(1, PDataValueType::Data, true, &[3])])
            .unwrap()
            .expect("data channel completed");
        assert_eq!(data, &[1, 2, 3]);
    }

    #[test]
    fn garbage_command_bytes_fail_assembly() {
        let mut assembler = CommandAssembler::default();
        let junk = vec![0xFFu8; 200];
        assert!(matches!(
            assembler.add(&[pdv(1, PDataValueType::Command, true, &junk)]),
            Err(AssemblyError::DecodeCommand { .. })
        ));
    }
}
