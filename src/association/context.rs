//! Presentation context negotiation and bookkeeping.
//!
//! The context manager is created empty alongside the state machine,
//! populated exactly once during the A-ASSOCIATE handshake,
//! and consulted read-only for the rest of the association.

use std::collections::HashMap;

use snafu::{ensure, Backtrace, OptionExt, Snafu};

use crate::pdu::{
    AssociationAC, AssociationRQ, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
};

/// A presentation context negotiated for the lifetime of one association.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// An error which may occur during association negotiation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum NegotiationError {
    #[snafu(display("association request carries no user information item"))]
    MissingUserInformation { backtrace: Backtrace },

    #[snafu(display("presentation context ID {} is not an odd number", id))]
    InvalidContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("presentation context ID {} appears more than once", id))]
    DuplicateContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("no presentation context was accepted"))]
    NoPresentationContextAccepted { backtrace: Backtrace },

    #[snafu(display("response refers to unknown presentation context ID {}", id))]
    UnknownContextId { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "context {} was accepted with transfer syntax `{}`, which was never proposed",
        id,
        transfer_syntax
    ))]
    UnexpectedTransferSyntax {
        id: u8,
        transfer_syntax: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Maintains the mapping between one-byte context IDs
/// and the negotiated (abstract syntax, transfer syntax) pairs,
/// along with the maximum PDU length advertised by the peer.
#[derive(Debug, Default, Clone)]
pub struct ContextManager {
    contexts: HashMap<u8, PresentationContext>,
    by_abstract_syntax: HashMap<String, u8>,
    proposed: HashMap<u8, PresentationContextProposed>,
    peer_max_pdu_length: u32,
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager::default()
    }

    /// Build the presentation context items of an A-ASSOCIATE-RQ:
    /// one per abstract syntax, each offering every transfer syntax,
    /// with context IDs assigned as consecutive odd numbers from 1.
    pub fn propose(
        &mut self,
        abstract_syntaxes: &[String],
        transfer_syntaxes: &[String],
    ) -> Vec<PresentationContextProposed> {
        // context IDs are odd u8 values, so at most 128 contexts fit
        let items: Vec<_> = abstract_syntaxes
            .iter()
            .take(128)
            .enumerate()
            .map(|(i, abstract_syntax)| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntaxes.to_vec(),
            })
            .collect();
        for item in &items {
            self.proposed.insert(item.id, item.clone());
        }
        items
    }

    /// Build the user information sub-items advertising
    /// this implementation and its maximum receivable PDU length.
    pub fn user_variables(&self, max_pdu_length: u32) -> Vec<UserVariableItem> {
        vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ]
    }

    /// Negotiate an inbound association request on the acceptor side.
    ///
    /// For each proposed context, the first proposed transfer syntax
    /// supported locally is selected;
    /// contexts with an unsupported abstract syntax or
    /// with no usable transfer syntax are refused individually.
    /// Accepted contexts are recorded in the manager.
    pub fn negotiate(
        &mut self,
        request: &AssociationRQ,
        abstract_syntaxes: &[String],
        transfer_syntaxes: &[String],
    ) -> Result<Vec<PresentationContextResult>> {
        ensure!(
            !request.user_variables.is_empty(),
            MissingUserInformationSnafu
        );
        self.peer_max_pdu_length = extract_max_length(&request.user_variables);

        let mut results = Vec::with_capacity(request.presentation_contexts.len());
        for proposed in &request.presentation_contexts {
            ensure!(proposed.id % 2 == 1, InvalidContextIdSnafu { id: proposed.id });
            ensure!(
                !self.contexts.contains_key(&proposed.id)
                    && !results
                        .iter()
                        .any(|r: &PresentationContextResult| r.id == proposed.id),
                DuplicateContextIdSnafu { id: proposed.id }
            );

            let fallback_syntax = || {
                proposed
                    .transfer_syntaxes
                    .first()
                    .cloned()
                    .unwrap_or_default()
            };

            if !abstract_syntaxes.contains(&proposed.abstract_syntax) {
                results.push(PresentationContextResult {
                    id: proposed.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: fallback_syntax(),
                });
                continue;
            }

            match proposed
                .transfer_syntaxes
                .iter()
                .find(|ts| transfer_syntaxes.contains(ts))
            {
                Some(transfer_syntax) => {
                    self.record(PresentationContext {
                        id: proposed.id,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: transfer_syntax.clone(),
                    });
                    results.push(PresentationContextResult {
                        id: proposed.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: transfer_syntax.clone(),
                    });
                }
                None => {
                    results.push(PresentationContextResult {
                        id: proposed.id,
                        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                        transfer_syntax: fallback_syntax(),
                    });
                }
            }
        }

        ensure!(
            results
                .iter()
                .any(|r| r.reason == PresentationContextResultReason::Acceptance),
            NoPresentationContextAcceptedSnafu
        );
        Ok(results)
    }

    /// Apply an inbound A-ASSOCIATE-AC on the requestor side,
    /// recording every accepted context against the earlier proposals.
    pub fn apply_response(&mut self, response: &AssociationAC) -> Result<()> {
        self.peer_max_pdu_length = extract_max_length(&response.user_variables);

        let mut accepted = 0usize;
        for result in &response.presentation_contexts {
            if result.reason != PresentationContextResultReason::Acceptance {
                continue;
            }
            let proposal = self
                .proposed
                .get(&result.id)
                .context(UnknownContextIdSnafu { id: result.id })?;
            ensure!(
                proposal.transfer_syntaxes.contains(&result.transfer_syntax),
                UnexpectedTransferSyntaxSnafu {
                    id: result.id,
                    transfer_syntax: result.transfer_syntax.clone(),
                }
            );
            let abstract_syntax = proposal.abstract_syntax.clone();
            self.record(PresentationContext {
                id: result.id,
                abstract_syntax,
                transfer_syntax: result.transfer_syntax.clone(),
            });
            accepted += 1;
        }

        ensure!(accepted > 0, NoPresentationContextAcceptedSnafu);
        Ok(())
    }

    fn record(&mut self, context: PresentationContext) {
        self.by_abstract_syntax
            .entry(context.abstract_syntax.clone())
            .or_insert(context.id);
        self.contexts.insert(context.id, context);
    }

    pub fn lookup_by_context_id(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.get(&id)
    }

    pub fn lookup_by_abstract_syntax(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.by_abstract_syntax
            .get(abstract_syntax)
            .and_then(|id| self.contexts.get(id))
    }

    /// The maximum PDU length advertised by the peer.
    /// Zero until the handshake has taken place.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// The negotiated contexts, in context ID order.
    pub fn snapshot(&self) -> Vec<PresentationContext> {
        let mut contexts: Vec<_> = self.contexts.values().cloned().collect();
        contexts.sort_by_key(|c| c.id);
        contexts
    }
}

fn extract_max_length(user_variables: &[UserVariableItem]) -> u32 {
    user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const MG_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1.2";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn request(
        contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    ) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "AET_A".to_string(),
            called_ae_title: "AET_B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: contexts,
            user_variables,
        }
    }

    #[test]
    fn proposals_use_consecutive_odd_ids() {
        let mut cm = ContextManager::new();
        let items = cm.propose(
            &strings(&[VERIFICATION, MG_STORAGE]),
            &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 1);
        assert_eq!(items[1].id, 3);
        assert!(items.iter().all(|i| i.id % 2 == 1));
        assert_eq!(items[0].transfer_syntaxes.len(), 2);
    }

    #[test]
    fn acceptor_selects_the_first_supported_transfer_syntax() {
        let mut cm = ContextManager::new();
        let rq = request(
            vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: strings(&[EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
            }],
            vec![UserVariableItem::MaxLength(32_768)],
        );
        let results = cm
            .negotiate(
                &rq,
                &strings(&[VERIFICATION]),
                &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, EXPLICIT_VR_LE);
        assert_eq!(cm.peer_max_pdu_length(), 32_768);

        let ctx = cm.lookup_by_abstract_syntax(VERIFICATION).unwrap();
        assert_eq!(ctx.id, 1);
        assert_eq!(ctx.transfer_syntax, EXPLICIT_VR_LE);
        assert_eq!(cm.lookup_by_context_id(1), Some(ctx));
    }

    #[test]
    fn acceptor_refuses_unknown_abstract_and_transfer_syntaxes() {
        let mut cm = ContextManager::new();
        let rq = request(
            vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: MG_STORAGE.to_string(),
                    transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
                },
                PresentationContextProposed {
                    id: 5,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: strings(&["1.2.840.10008.1.2.4.50"]),
                },
            ],
            vec![UserVariableItem::MaxLength(16_384)],
        );
        let results = cm
            .negotiate(&rq, &strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE]))
            .unwrap();
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(
            results[2].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
        // only the accepted context is usable afterwards
        assert!(cm.lookup_by_context_id(1).is_some());
        assert!(cm.lookup_by_context_id(3).is_none());
        assert!(cm.lookup_by_context_id(5).is_none());
    }

    #[test]
    fn negotiation_requires_user_information() {
        let mut cm = ContextManager::new();
        let rq = request(
            vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
            }],
            vec![],
        );
        assert!(matches!(
            cm.negotiate(&rq, &strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE])),
            Err(NegotiationError::MissingUserInformation { .. })
        ));
    }

    #[test]
    fn negotiation_rejects_duplicate_and_even_context_ids() {
        let mut cm = ContextManager::new();
        let rq = request(
            vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
                },
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
                },
            ],
            vec![UserVariableItem::MaxLength(16_384)],
        );
        assert!(matches!(
            cm.negotiate(&rq, &strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE])),
            Err(NegotiationError::DuplicateContextId { id: 1, .. })
        ));

        let mut cm = ContextManager::new();
        let rq = request(
            vec![PresentationContextProposed {
                id: 2,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
            }],
            vec![UserVariableItem::MaxLength(16_384)],
        );
        assert!(matches!(
            cm.negotiate(&rq, &strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE])),
            Err(NegotiationError::InvalidContextId { id: 2, .. })
        ));
    }

    #[test]
    fn all_contexts_refused_is_a_negotiation_failure() {
        let mut cm = ContextManager::new();
        let rq = request(
            vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: MG_STORAGE.to_string(),
                transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
            }],
            vec![UserVariableItem::MaxLength(16_384)],
        );
        assert!(matches!(
            cm.negotiate(&rq, &strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE])),
            Err(NegotiationError::NoPresentationContextAccepted { .. })
        ));
    }

    #[test]
    fn requestor_records_accepted_contexts_from_the_response() {
        let mut cm = ContextManager::new();
        cm.propose(
            &strings(&[VERIFICATION, MG_STORAGE]),
            &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
        );
        let ac = AssociationAC {
            protocol_version: 1,
            calling_ae_title: "AET_A".to_string(),
            called_ae_title: "AET_B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
            ],
            user_variables: vec![UserVariableItem::MaxLength(65_536)],
        };
        cm.apply_response(&ac).unwrap();
        assert_eq!(cm.peer_max_pdu_length(), 65_536);
        assert!(cm.lookup_by_context_id(1).is_some());
        assert!(cm.lookup_by_context_id(3).is_none());

        let snapshot = cm.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].abstract_syntax, VERIFICATION);
    }

    #[test]
    fn requestor_refuses_a_response_for_an_unknown_context() {
        let mut cm = ContextManager::new();
        cm.propose(&strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE]));
        let ac = AssociationAC {
            protocol_version: 1,
            calling_ae_title: "AET_A".to_string(),
            called_ae_title: "AET_B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextResult {
                id: 9,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }],
            user_variables: vec![],
        };
        assert!(matches!(
            cm.apply_response(&ac),
            Err(NegotiationError::UnknownContextId { id: 9, .. })
        ));
    }

    #[test]
    fn requestor_fails_when_every_context_was_rejected() {
        let mut cm = ContextManager::new();
        cm.propose(&strings(&[VERIFICATION]), &strings(&[IMPLICIT_VR_LE]));
        let ac = AssociationAC {
            protocol_version: 1,
            calling_ae_title: "AET_A".to_string(),
            called_ae_title: "AET_B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }],
            user_variables: vec![],
        };
        assert!(matches!(
            cm.apply_response(&ac),
            Err(NegotiationError::NoPresentationContextAccepted { .. })
        ));
    }
}
