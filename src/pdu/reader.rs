//! PDU decoder.
//!
//! [`read_pdu`] blocks on the given source until a full PDU is framed,
//! then parses it into a [`Pdu`] value.
//! PDUs longer than the given maximum are refused outright,
//! before the payload is consumed.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};

/// An error which may occur when reading a PDU.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// The stream ended before a PDU header was available.
    /// This is the normal way of learning that the peer closed the stream.
    #[snafu(display("no PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU: {}", source))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU item: {}", source))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`: {}", field, source))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("could not decode text field `{}`: {}", field, source))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("unexpected item in PDU variable field: type {:#04x}", item_type))]
    UnexpectedPduVariable { item_type: u8, backtrace: Backtrace },

    #[snafu(display("invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("multiple transfer syntaxes were accepted in one context"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item {:#04x}", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },

    #[snafu(display("presentation data value item is too short"))]
    PdvTooShort { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, ReadError>;

/// Read a full PDU from the given source.
///
/// `max_pdu_length` bounds the admissible PDU length field;
/// it is clamped to the interval
/// [[`MINIMUM_PDU_SIZE`], [`MAXIMUM_PDU_SIZE`]] by precondition.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // If the first two bytes are not available, no PDU has begun
    // and the stream was closed in between messages. Failures after
    // this point mean a PDU was truncated mid-transfer.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    ensure!(
        pdu_length <= max_pdu_length,
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length
        }
    );

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ and A-ASSOCIATE-AC share their layout:
            // protocol version, reserved bytes, two AE title fields,
            // a 32-byte reserved block, then the variable items
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;
            cursor
                .read_u16::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            let called_ae_title = read_ae_title(&mut cursor, "Called-AE-title", &codec)?;
            let calling_ae_title = read_ae_title(&mut cursor, "Calling-AE-title", &codec)?;

            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            let mut application_context_name: Option<String> = None;
            let mut proposed = vec![];
            let mut results = vec![];
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                        proposed.push(val);
                    }
                    PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                        results.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        tracing::debug!(
                            "ignoring unrecognized item {:#04x} in association PDU",
                            item_type
                        );
                    }
                    PduVariableItem::PresentationContextProposed(_) => {
                        return UnexpectedPduVariableSnafu { item_type: 0x20u8 }.fail();
                    }
                    PduVariableItem::PresentationContextResult(_) => {
                        return UnexpectedPduVariableSnafu { item_type: 0x21u8 }.fail();
                    }
                }
            }

            let application_context_name =
                application_context_name.context(MissingApplicationContextNameSnafu)?;

            if pdu_type == 0x01 {
                Ok(Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: proposed,
                    user_variables,
                }))
            } else {
                Ok(Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: results,
                    user_variables,
                }))
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ: reserved byte, result, source, reason
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let result = AssociationRJResult::from_code(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            let source_byte = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason_byte = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;
            let source = AssociationRJSource::from_codes(source_byte, reason_byte)
                .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: a sequence of presentation data value items,
            // each carrying its own 4-byte length prefix
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(item_length >= 2, PdvTooShortSnafu);

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // message control header:
                // bit 0 = command, bit 1 = last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;

                let data = read_exact_n(&mut cursor, (item_length - 2) as usize).context(
                    ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    },
                )?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let source_byte = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason_byte = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag",
            })?;
            let source = AbortRQSource::from_codes(source_byte, reason_byte)
                .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        }),
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

/// Like `read_n`, but a short read is an error.
fn read_exact_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let result = read_n(reader, bytes_to_read)?;
    if result.len() != bytes_to_read {
        return Err(std::io::Error::from(ErrorKind::UnexpectedEof));
    }
    Ok(result)
}

/// Read a fixed 16-byte AE title field,
/// trimming the non-significant surrounding spaces.
fn read_ae_title<R>(reader: &mut R, field: &'static str, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_exact_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context item
            let val = codec.decode(&cursor.into_inner()).context(DecodeTextSnafu {
                field: "Application-context-name",
            })?;
            Ok(PduVariableItem::ApplicationContext(val.trim().to_string()))
        }
        0x20 => {
            // Presentation Context item (proposed):
            // context ID, 3 reserved bytes,
            // one abstract syntax and one or more transfer syntax sub-items
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        let name = read_exact_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Abstract-syntax-name",
                            },
                        )?;
                        abstract_syntax = Some(
                            codec
                                .decode(&name)
                                .context(DecodeTextSnafu {
                                    field: "Abstract-syntax-name",
                                })?
                                .trim()
                                .to_string(),
                        );
                    }
                    0x40 => {
                        let name = read_exact_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Transfer-syntax-name",
                            },
                        )?;
                        transfer_syntaxes.push(
                            codec
                                .decode(&name)
                                .context(DecodeTextSnafu {
                                    field: "Transfer-syntax-name",
                                })?
                                .trim()
                                .to_string(),
                        );
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu { item_type }.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (result):
            // context ID, reserved, result/reason, reserved,
            // then exactly one transfer syntax sub-item
            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let reason = PresentationContextResultReason::from_code(
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Result/Reason",
                })?,
            )
            .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        let name = read_exact_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Transfer-syntax-name",
                            },
                        )?;
                        transfer_syntax = Some(
                            codec
                                .decode(&name)
                                .context(DecodeTextSnafu {
                                    field: "Transfer-syntax-name",
                                })?
                                .trim()
                                .to_string(),
                        );
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu { item_type }.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information item: a container of sub-items
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        let uid = read_exact_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Implementation-class-uid",
                            },
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            codec
                                .decode(&uid)
                                .context(DecodeTextSnafu {
                                    field: "Implementation-class-uid",
                                })?
                                .trim()
                                .to_string(),
                        ));
                    }
                    0x53 => {
                        let invoked = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                            field: "Maximum-number-operations-invoked",
                        })?;
                        let performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables.push(UserVariableItem::AsynchronousOperationsWindow(
                            invoked, performed,
                        ));
                    }
                    0x54 => {
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "UID-length",
                            })?;
                        let uid = read_exact_n(&mut cursor, uid_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "SOP-class-uid",
                            },
                        )?;
                        let sop_class_uid = codec
                            .decode(&uid)
                            .context(DecodeTextSnafu {
                                field: "SOP-class-uid",
                            })?
                            .trim()
                            .to_string();
                        let scu_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                        let scp_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCP-role" })?;
                        user_variables.push(UserVariableItem::RoleSelection {
                            sop_class_uid,
                            scu_role,
                            scp_role,
                        });
                    }
                    0x55 => {
                        let name = read_exact_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Implementation-version-name",
                            },
                        )?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            codec
                                .decode(&name)
                                .context(DecodeTextSnafu {
                                    field: "Implementation-version-name",
                                })?
                                .trim()
                                .to_string(),
                        ));
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_exact_n(&mut cursor, item_length as usize).context(
                                ReadPduFieldSnafu { field: "Unknown" },
                            )?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
