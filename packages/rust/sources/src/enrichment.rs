//! Phase-2 collaborators over HTTP: the identity verifier and the four
//! folio-keyed enrichment sources.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use lienflow_core::{EnrichmentSource, Verifier};
use lienflow_shared::{
    Entity, FloodRecord, Identity, MarketRecord, PermitRecord, PipelineError, Result, SourceData,
    SourceKind, TaxRecord, VerifiedIdentity,
};

use crate::client::ServiceClient;

#[derive(Serialize)]
struct VerifyRequest<'a> {
    case_number: &'a str,
    folio: Option<&'a str>,
    address: &'a str,
}

/// Property-appraiser lookup: `POST {base}/verify`.
pub struct HttpVerifier {
    client: ServiceClient,
}

impl HttpVerifier {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            client: ServiceClient::new(base)?,
        })
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, entity: &Entity) -> Result<VerifiedIdentity> {
        let url = self.client.endpoint(&["verify"])?;
        let verified: VerifiedIdentity = self
            .client
            .post_json(
                url,
                &VerifyRequest {
                    case_number: &entity.case_number,
                    folio: entity.folio.as_deref(),
                    address: &entity.address,
                },
            )
            .await?;
        if verified.folio.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "verifier returned an empty folio for {}",
                entity.case_number
            )));
        }
        Ok(verified)
    }
}

/// A folio-keyed source: `GET {base}/{folio}`, decoded into the record type
/// for `kind`.
pub struct HttpEnrichmentSource {
    kind: SourceKind,
    client: ServiceClient,
}

impl HttpEnrichmentSource {
    pub fn new(kind: SourceKind, base: Url) -> Result<Self> {
        if kind == SourceKind::Verifier {
            return Err(PipelineError::config(
                "the verifier is not a folio-keyed source; use HttpVerifier",
            ));
        }
        Ok(Self {
            kind,
            client: ServiceClient::new(base)?,
        })
    }
}

#[async_trait]
impl EnrichmentSource for HttpEnrichmentSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, identity: &Identity) -> Result<SourceData> {
        let url = self.client.endpoint(&[identity.require_folio()?])?;
        Ok(match self.kind {
            SourceKind::Tax => SourceData::Tax(self.client.get_json::<TaxRecord>(url).await?),
            SourceKind::Permit => {
                SourceData::Permit(self.client.get_json::<PermitRecord>(url).await?)
            }
            SourceKind::Market => {
                SourceData::Market(self.client.get_json::<MarketRecord>(url).await?)
            }
            SourceKind::Flood => SourceData::Flood(self.client.get_json::<FloodRecord>(url).await?),
            SourceKind::Verifier => {
                return Err(PipelineError::config("verifier cannot be fetched by folio"));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entity() -> Entity {
        Entity {
            case_number: "2024-CA-000123".into(),
            folio: Some("1929180001".into()),
            address: "100 Bayshore Blvd".into(),
            auction_date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
            judgment_amount: Some(180_000.0),
            plaintiff: None,
        }
    }

    #[tokio::test]
    async fn verifier_posts_entity_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_partial_json(serde_json::json!({ "folio": "1929180001" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "folio": "1929180001",
                "address": "100 BAYSHORE BLVD",
                "owner_names": ["DOE JOHN"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let verifier = HttpVerifier::new(Url::parse(&server.uri()).unwrap()).unwrap();
        let verified = verifier.verify(&entity()).await.unwrap();
        assert_eq!(verified.owner_names, vec!["DOE JOHN".to_string()]);
        assert!(verified.legal_description.is_none());
    }

    #[tokio::test]
    async fn source_fetches_by_folio() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/market/1929180001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "estimated_value": 312000.0,
                "last_sale_date": "2016-03-01"
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/market/", server.uri())).unwrap();
        let source = HttpEnrichmentSource::new(SourceKind::Market, base).unwrap();
        let data = source
            .fetch(&Identity::from_seed(&entity()))
            .await
            .unwrap();
        let SourceData::Market(record) = data else {
            panic!("expected market data, got {data:?}");
        };
        assert_eq!(record.estimated_value, Some(312_000.0));
        assert_eq!(record.last_sale_date, NaiveDate::from_ymd_opt(2016, 3, 1));
    }

    #[tokio::test]
    async fn source_without_folio_is_a_validation_error() {
        let source =
            HttpEnrichmentSource::new(SourceKind::Flood, Url::parse("http://127.0.0.1:9/").unwrap())
                .unwrap();
        let mut seed = entity();
        seed.folio = None;
        let err = source.fetch(&Identity::from_seed(&seed)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[test]
    fn verifier_kind_is_not_a_source() {
        let base = Url::parse("https://appraiser.example.com/").unwrap();
        assert!(HttpEnrichmentSource::new(SourceKind::Verifier, base).is_err());
    }
}
