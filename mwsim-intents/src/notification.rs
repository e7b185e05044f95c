//! Push-notification tap payloads.

use serde::{Deserialize, Serialize};

use crate::parser::{classify, Classification, TriggerSource};
use crate::{is_valid_id, PaymentIntent, TransferTokenIntent};

/// Data carried by a tapped notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub payment_request_id: Option<String>,
    #[serde(default)]
    pub transfer_token_id: Option<String>,
}

impl NotificationPayload {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Classify the payload.
    ///
    /// A URL wins and is classified like a deep link. Without one, a valid
    /// payment id is preferred over a valid transfer token id; a malformed id
    /// is ignored rather than masking the other field.
    pub fn classify(&self) -> Classification {
        if let Some(ref url) = self.url {
            return classify(url, TriggerSource::Notification);
        }

        let payment_id = self.payment_request_id.as_deref().filter(|id| is_valid_id(id));
        let token_id = self.transfer_token_id.as_deref().filter(|id| is_valid_id(id));
        let intent = match (payment_id, token_id) {
            (Some(id), _) => PaymentIntent::new(id).into(),
            (None, Some(id)) => TransferTokenIntent::new(id).into(),
            (None, None) => return Classification::Unrecognized,
        };
        Classification::Recognized { intent }
    }

    /// Short description for logs and error messages.
    pub fn describe(&self) -> String {
        self.url
            .clone()
            .or_else(|| self.payment_request_id.clone())
            .or_else(|| self.transfer_token_id.clone())
            .unwrap_or_else(|| "<empty notification>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParsedIntent;

    fn intent(payload: &NotificationPayload) -> Option<ParsedIntent> {
        payload.classify().intent().cloned()
    }

    #[test]
    fn test_url_classified_as_deep_link() {
        let payload = NotificationPayload::with_url("https://wsim.banksim.ca/pay/abc123");
        assert_eq!(intent(&payload), Some(PaymentIntent::new("abc123").into()));

        // Bare ids are camera-only.
        let payload = NotificationPayload::with_url("tok_1");
        assert_eq!(intent(&payload), None);
    }

    #[test]
    fn test_explicit_ids() {
        let payload = NotificationPayload {
            payment_request_id: Some("req_1".into()),
            transfer_token_id: Some("tok_1".into()),
            ..Default::default()
        };
        assert_eq!(intent(&payload), Some(PaymentIntent::new("req_1").into()));

        let payload = NotificationPayload {
            transfer_token_id: Some("tok_1".into()),
            ..Default::default()
        };
        assert_eq!(intent(&payload), Some(TransferTokenIntent::new("tok_1").into()));
    }

    #[test]
    fn test_empty_or_malformed_payload_unrecognized() {
        assert_eq!(NotificationPayload::default().classify(), Classification::Unrecognized);

        let payload = NotificationPayload {
            payment_request_id: Some("bad id".into()),
            ..Default::default()
        };
        assert_eq!(payload.classify(), Classification::Unrecognized);

        let payload = NotificationPayload {
            payment_request_id: Some("bad id".into()),
            transfer_token_id: Some("also/bad".into()),
            ..Default::default()
        };
        assert_eq!(payload.classify(), Classification::Unrecognized);
    }

    #[test]
    fn test_malformed_payment_id_falls_back_to_token() {
        let payload = NotificationPayload {
            payment_request_id: Some("bad id".into()),
            transfer_token_id: Some("tok_9".into()),
            ..Default::default()
        };
        assert_eq!(
            intent(&payload),
            Some(ParsedIntent::from(TransferTokenIntent::new("tok_9")))
        );
    }

    #[test]
    fn test_deserialize_camel_case() {
        let payload: NotificationPayload =
            serde_json::from_str(r#"{"transferTokenId": "tok_9"}"#).unwrap();
        assert_eq!(payload.transfer_token_id.as_deref(), Some("tok_9"));
    }
}
