// translator.rs — The natural-language drafting contract.
//
// The translator is an external inference endpoint that turns operator
// prose into a *draft* rule document. Its output never reaches the
// backend directly: the facade converts the draft through the normal
// builder (validation included), renders it, and conflict-analyzes it
// exactly like a hand-written rule. A missing or failing translator only
// disables prose input; structured proposals keep working.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use aegis_policy::{Action, Direction, PolicyRule, PortSpec, Protocol, RuleOrigin};

use crate::error::{ErrorKind, ServiceError};

/// The draft document the endpoint returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub direction: Option<String>,
    pub action: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub destination_port: Option<PortSpec>,
    #[serde(default)]
    pub source_port: Option<PortSpec>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Why the translator drafted this; surfaced on the proposal.
    #[serde(default)]
    pub explanation: String,
}

impl RuleDraft {
    /// Convert the draft into a validated rule. Operator prose yields an
    /// operator rule: origin is always `user`.
    pub fn into_rule(self) -> Result<PolicyRule, ServiceError> {
        let mut builder = PolicyRule::builder().origin(RuleOrigin::User);

        builder = builder.action(match self.action.as_str() {
            "drop" => Action::Drop,
            "reject" => Action::Reject,
            "accept" => Action::Accept,
            other => {
                return Err(ServiceError::validation(format!(
                    "draft action '{}' is not drop/reject/accept",
                    other
                )))
            }
        });

        if let Some(direction) = self.direction.as_deref() {
            builder = builder.direction(match direction {
                "input" => Direction::Input,
                "output" => Direction::Output,
                "forward" => Direction::Forward,
                other => {
                    return Err(ServiceError::validation(format!(
                        "draft direction '{}' is not input/output/forward",
                        other
                    )))
                }
            });
        }

        if let Some(source) = self.source.as_deref() {
            builder = builder.source(source)?;
        }
        if let Some(destination) = self.destination.as_deref() {
            builder = builder.destination(destination)?;
        }
        if let Some(protocol) = self.protocol.as_deref() {
            builder = builder.protocol(match protocol {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                "icmp" => Protocol::Icmp,
                "any" => Protocol::Any,
                other => {
                    return Err(ServiceError::validation(format!(
                        "draft protocol '{}' is not tcp/udp/icmp/any",
                        other
                    )))
                }
            });
        }
        if let Some(ports) = self.destination_port {
            builder = builder.destination_port(ports);
        }
        if let Some(ports) = self.source_port {
            builder = builder.source_port(ports);
        }
        if let Some(comment) = self.comment {
            builder = builder.comment(comment);
        }

        Ok(builder.build()?)
    }
}

/// The drafting contract.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn draft(&self, text: &str) -> Result<RuleDraft, ServiceError>;
}

/// No endpoint configured: prose proposals are unavailable.
pub struct DisabledTranslator;

#[async_trait]
impl Translator for DisabledTranslator {
    async fn draft(&self, _text: &str) -> Result<RuleDraft, ServiceError> {
        Err(ServiceError::new(
            ErrorKind::Validation,
            "no translator endpoint configured; submit a structured rule instead",
        ))
    }
}

/// HTTP translator against a configured inference endpoint.
///
/// POSTs `{"intent": <text>}` and expects a RuleDraft JSON document back.
pub struct HttpTranslator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn draft(&self, text: &str) -> Result<RuleDraft, ServiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "intent": text }))
            .send()
            .await
            .map_err(|e| {
                ServiceError::new(ErrorKind::Internal, format!("translator request: {}", e))
            })?;
        let draft: RuleDraft = response
            .error_for_status()
            .map_err(|e| ServiceError::new(ErrorKind::Internal, format!("translator: {}", e)))?
            .json()
            .await
            .map_err(|e| {
                ServiceError::new(
                    ErrorKind::Internal,
                    format!("translator returned malformed draft: {}", e),
                )
            })?;
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_converts_to_operator_rule() {
        let draft = RuleDraft {
            direction: Some("input".to_string()),
            action: "drop".to_string(),
            source: Some("203.0.113.0/24".to_string()),
            destination: None,
            protocol: Some("tcp".to_string()),
            destination_port: Some(PortSpec::Single(22)),
            source_port: None,
            comment: Some("block scanners".to_string()),
            explanation: "you asked to block the scanner subnet".to_string(),
        };
        let rule = draft.into_rule().unwrap();
        assert_eq!(rule.origin, RuleOrigin::User);
        assert_eq!(rule.action, Action::Drop);
        assert_eq!(rule.source_net().unwrap().to_string(), "203.0.113.0/24");
    }

    #[test]
    fn bad_draft_fields_are_validation_errors() {
        let draft = RuleDraft {
            direction: None,
            action: "obliterate".to_string(),
            source: None,
            destination: None,
            protocol: None,
            destination_port: None,
            source_port: None,
            comment: None,
            explanation: String::new(),
        };
        let err = draft.into_rule().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn draft_json_round_trip() {
        let json = r#"{
            "action": "drop",
            "source": "198.51.100.4",
            "protocol": "tcp",
            "destination_port": {"single": 443},
            "explanation": "block the noisy host"
        }"#;
        let draft: RuleDraft = serde_json::from_str(json).unwrap();
        assert_eq!(draft.destination_port, Some(PortSpec::Single(443)));
        let rule = draft.into_rule().unwrap();
        assert_eq!(rule.destination_port, Some(PortSpec::Single(443)));
    }

    #[tokio::test]
    async fn disabled_translator_refuses_politely() {
        let err = DisabledTranslator.draft("block everything").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("structured rule"));
    }
}
