//! In-process title-chain builder.
//!
//! Walks extracted documents in recording order and builds the encumbrance
//! ledger: encumbering instruments become ledger entries, satisfactions and
//! assignments link to their targets by instrument number, and the most
//! recent deed's grantee becomes the owner of record.

use async_trait::async_trait;

use lienflow_shared::{
    DocumentType, Encumbrance, EncumbranceLedger, ExtractedDocument, Result, TitleChainResult,
};

use crate::collaborators::ChainBuilder;

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerChainBuilder;

impl LedgerChainBuilder {
    pub fn build(&self, entity_id: &str, docs: &[ExtractedDocument]) -> TitleChainResult {
        let mut ordered: Vec<&ExtractedDocument> = docs.iter().collect();
        ordered.sort_by(|a, b| {
            a.recorded_date
                .cmp(&b.recorded_date)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });

        let mut ledger = EncumbranceLedger::default();
        let mut owner_of_record = None;
        let mut warnings = Vec::new();

        // Encumbrances first, so releases recorded out of order still resolve.
        for doc in ordered.iter().filter(|d| d.doc_type.is_encumbrance()) {
            ledger.insert(Encumbrance {
                instrument_number: doc.document_id.clone(),
                doc_type: doc.doc_type,
                amount: doc.amount,
                recorded_date: doc.recorded_date,
                holder: doc.parties.first().cloned(),
                satisfied_by: None,
                assignments: Vec::new(),
            });
        }

        for doc in &ordered {
            match doc.doc_type {
                DocumentType::Satisfaction => {
                    for target in &doc.references {
                        if !ledger.mark_satisfied(target, &doc.document_id) {
                            warnings.push(format!(
                                "satisfaction {} references unknown instrument {target}",
                                doc.document_id
                            ));
                        }
                    }
                }
                DocumentType::Assignment => {
                    for target in &doc.references {
                        if !ledger.add_assignment(target, &doc.document_id) {
                            warnings.push(format!(
                                "assignment {} references unknown instrument {target}",
                                doc.document_id
                            ));
                        }
                    }
                }
                // Deed parties are [grantor, ..., grantee].
                DocumentType::Deed => {
                    if let Some(grantee) = doc.parties.last() {
                        owner_of_record = Some(grantee.clone());
                    }
                }
                _ => {}
            }
        }

        TitleChainResult {
            entity_id: entity_id.to_string(),
            ledger,
            owner_of_record,
            warnings,
        }
    }
}

#[async_trait]
impl ChainBuilder for LedgerChainBuilder {
    async fn analyze(&self, entity_id: &str, docs: &[ExtractedDocument]) -> Result<TitleChainResult> {
        Ok(self.build(entity_id, docs))
    }
}
