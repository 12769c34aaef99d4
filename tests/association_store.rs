//! A C-STORE exchange with a payload large enough
//! to be fragmented across several P-DATA-TF PDUs.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use dicom_dul::association::{AcceptorOptions, RequestorOptions, Upcall};
use dicom_dul::dimse::commands::{CStoreRq, CStoreRsp, Command};
use dicom_dul::dimse::{CommandField, Status};

static SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
static SOP_INSTANCE: &str = "2.25.23099252019720517551279554742972481978";

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn large_store_payload_survives_fragmentation() {
    // the payload does not need to be a real data set for the engine;
    // it is moved opaque and verified byte for byte
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let association = AcceptorOptions::new()
            .ae_title("STORE-SCP")
            .with_abstract_syntax(SECONDARY_CAPTURE)
            .max_pdu_length(16_384)
            .spawn(stream)
            .unwrap();

        match association.upcalls().recv_timeout(TIMEOUT) {
            Ok(Upcall::HandshakeCompleted { contexts, .. }) => {
                assert_eq!(contexts.len(), 1);
                assert_eq!(contexts[0].abstract_syntax, SECONDARY_CAPTURE);
            }
            other => panic!("expected handshake completion, got {:?}", other),
        }

        match association.upcalls().recv_timeout(TIMEOUT) {
            Ok(Upcall::Data { command, data, .. }) => {
                assert_eq!(command.command_field(), CommandField::CStoreRq);
                assert_eq!(command.message_id(), 5);
                assert!(command.has_data());
                assert_eq!(data.len(), expected.len());
                assert_eq!(data, expected);
            }
            other => panic!("expected the store request, got {:?}", other),
        }

        let response = CStoreRsp::builder()
            .message_id_being_responded_to(5)
            .affected_sop_class_uid(SECONDARY_CAPTURE)
            .affected_sop_instance_uid(SOP_INSTANCE)
            .status(Status::SUCCESS)
            .build()
            .command_set()
            .unwrap();
        association
            .send_dimse(SECONDARY_CAPTURE, response, vec![])
            .unwrap();

        match association.upcalls().recv_timeout(TIMEOUT) {
            Err(RecvTimeoutError::Disconnected) => {}
            other => panic!("expected the association to end, got {:?}", other),
        }
        association.join();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .spawn(stream)
        .unwrap();

    let peer_max = match association.upcalls().recv_timeout(TIMEOUT) {
        Ok(Upcall::HandshakeCompleted {
            peer_max_pdu_length,
            ..
        }) => peer_max_pdu_length,
        other => panic!("expected handshake completion, got {:?}", other),
    };
    assert_eq!(peer_max, 16_384);

    let request = CStoreRq::builder()
        .message_id(5)
        .affected_sop_class_uid(SECONDARY_CAPTURE)
        .affected_sop_instance_uid(SOP_INSTANCE)
        .build()
        .command_set()
        .unwrap();
    association
        .send_dimse(SECONDARY_CAPTURE, request, payload)
        .unwrap();

    match association.upcalls().recv_timeout(TIMEOUT) {
        Ok(Upcall::Data { command, .. }) => {
            assert_eq!(command.command_field(), CommandField::CStoreRsp);
            assert_eq!(command.message_id(), 5);
            assert_eq!(command.status(), Some(Status::SUCCESS));
        }
        other => panic!("expected the store response, got {:?}", other),
    }

    association.release().unwrap();
    match association.upcalls().recv_timeout(TIMEOUT) {
        Err(RecvTimeoutError::Disconnected) => {}
        other => panic!("expected the association to end, got {:?}", other),
    }
    association.join();
    scp.join().unwrap();
}
