//! PDU encoder.
//!
//! Every length-prefixed portion of a PDU is produced through
//! [`write_chunk_u32`] and [`write_chunk_u16`],
//! which buffer the inner content so that the preceding length field
//! can be filled in with the exact byte count.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

/// An error which may occur when writing a PDU.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("could not write PDU field `{}`: {}", field, source))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not encode text field `{}`: {}", field, source))]
    EncodeText {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("AE titles must not be empty"))]
    EmptyAeTitle { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, WriteError>;

/// Run `func` over a scratch buffer,
/// then write the buffer prefixed by its length as a big endian u32.
pub(crate) fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteFieldSnafu { field: "Length" })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: "Payload" })?;
    Ok(())
}

/// Same as [`write_chunk_u32`], but with a big endian u16 length prefix.
pub(crate) fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteFieldSnafu { field: "Item-length" })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: "Item" })?;
    Ok(())
}

/// Encode an AE title into its 16-byte wire form,
/// right-padded with spaces (20H).
fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    field: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    ensure!(!ae_title.trim().is_empty(), EmptyAeTitleSnafu);
    let mut bytes = codec.encode(ae_title).context(EncodeTextSnafu { field })?;
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Serialize a PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ PDU structure, PS3.8 §9.3.2
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x0000)
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;
                // bytes 43-74 are reserved
                writer
                    .write_all(&[0u8; 32])
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC PDU structure, PS3.8 §9.3.3;
            // bytes 11-42 echo the AE titles of the request
            // and are not tested on receipt
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x0000)
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;
                writer
                    .write_all(&[0u8; 32])
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // A-ASSOCIATE-RJ PDU structure, PS3.8 §9.3.4
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                writer
                    .write_u8(result.code())
                    .context(WriteFieldSnafu { field: "Result" })?;
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
                Ok(())
            })
        }
        Pdu::PData { data } => {
            // P-DATA-TF PDU structure, PS3.8 §9.3.5
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;

            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer.write_u8(pdv.presentation_context_id).context(
                            WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            },
                        )?;
                        // message control header:
                        // bit 0 = command, bit 1 = last fragment
                        let mut header = 0x00;
                        if pdv.value_type == PDataValueType::Command {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        writer.write_u8(header).context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;
                        writer.write_all(&pdv.data).context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            // A-RELEASE-RQ PDU structure, PS3.8 §9.3.6
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                Ok(())
            })
        }
        Pdu::ReleaseRP => {
            // A-RELEASE-RP PDU structure, PS3.8 §9.3.7
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                Ok(())
            })
        }
        Pdu::AbortRQ { source } => {
            // A-ABORT PDU structure, PS3.8 §9.3.8
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                writer
                    .write_u8(0x00)
                    .context(WriteFieldSnafu { field: "Reserved" })?;
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })?;
                Ok(())
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(data)
                    .context(WriteFieldSnafu { field: "Unknown" })?;
                Ok(())
            })
        }
    }
}

fn write_application_context(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Application Context item (10H), PS3.8 §9.3.2.1
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&codec.encode(application_context_name).context(
                EncodeTextSnafu {
                    field: "Application-context-name",
                },
            )?)
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })?;
        Ok(())
    })
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context item (20H), PS3.8 §9.3.2.2
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0u8; 3])
            .context(WriteFieldSnafu { field: "Reserved" })?;

        // one Abstract Syntax sub-item (30H)
        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteFieldSnafu { field: "Reserved" })?;
        write_chunk_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.abstract_syntax)
                        .context(EncodeTextSnafu {
                            field: "Abstract-syntax-name",
                        })?,
                )
                .context(WriteFieldSnafu {
                    field: "Abstract-syntax-name",
                })?;
            Ok(())
        })?;

        // one or more Transfer Syntax sub-items (40H)
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "Reserved" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_all(&codec.encode(transfer_syntax).context(EncodeTextSnafu {
                        field: "Transfer-syntax-name",
                    })?)
                    .context(WriteFieldSnafu {
                        field: "Transfer-syntax-name",
                    })?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context item (21H), PS3.8 §9.3.3.2
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteFieldSnafu { field: "Reserved" })?;
        writer
            .write_u8(presentation_context.reason.code())
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteFieldSnafu { field: "Reserved" })?;

        // one Transfer Syntax sub-item (40H),
        // not significant unless the context was accepted
        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteFieldSnafu { field: "Reserved" })?;
        write_chunk_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.transfer_syntax)
                        .context(EncodeTextSnafu {
                            field: "Transfer-syntax-name",
                        })?,
                )
                .context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
            Ok(())
        })
    })
}

fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information item (50H), PS3.8 §9.3.2.3
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_u32::<BigEndian>(*max_length).context(
                            WriteFieldSnafu {
                                field: "Maximum-length-received",
                            },
                        )?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(uid).context(EncodeTextSnafu {
                                field: "Implementation-class-uid",
                            })?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-class-uid",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(name).context(EncodeTextSnafu {
                                field: "Implementation-version-name",
                            })?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::AsynchronousOperationsWindow(invoked, performed) => {
                    writer
                        .write_u8(0x53)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_u16::<BigEndian>(*invoked).context(
                            WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            },
                        )?;
                        writer.write_u16::<BigEndian>(*performed).context(
                            WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            },
                        )?;
                        Ok(())
                    })?;
                }
                UserVariableItem::RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                } => {
                    writer
                        .write_u8(0x54)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        let uid = codec.encode(sop_class_uid).context(EncodeTextSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "UID-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u8(*scu_role)
                            .context(WriteFieldSnafu { field: "SCU-role" })?;
                        writer
                            .write_u8(*scp_role)
                            .context(WriteFieldSnafu { field: "SCP-role" })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteFieldSnafu { field: "Reserved" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })?;
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}
