//! Classification of raw trigger strings into intents.
//!
//! ## Recognized formats
//!
//! ```text
//! https://transfer.banksim.ca/pay/<id>          transfer token
//! https://transfersim-dev.banksim.ca/pay/<id>   transfer token (dev)
//! https://wsim.banksim.ca/pay/<id>              payment request
//! https://wsim-dev.banksim.ca/pay/<id>          payment request (dev)
//! mwsim://payment/<id>[?sourceBrowser=<b>]      payment request
//! tsim://pay/<id>                               transfer token (legacy)
//! <id>                                          transfer token (camera payload only)
//! ```
//!
//! The input spaces overlap, so rules are tried in the fixed order above and
//! the first match wins. Scheme and host are compared case-sensitively, the id
//! must be `[a-zA-Z0-9_-]+` and must run to the end of the input.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::{
    IntentError, ParsedIntent, PaymentIntent, Result, TransferTokenIntent, APP_SCHEME,
    LEGACY_TRANSFER_SCHEME, PAYMENT_DEV_HOST, PAYMENT_HOST, SOURCE_BROWSER_PARAM,
    TRANSFER_DEV_HOST, TRANSFER_HOST,
};

const PAY_PATH: &str = "/pay/";

/// Where a trigger string came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// A URL the OS handed to the app.
    DeepLink,
    /// A camera-scanned QR payload.
    Scan,
    /// A URL carried by a push notification.
    Notification,
}

impl TriggerSource {
    /// Bare ids are only meaningful inside a QR payload.
    fn accepts_bare_id(self) -> bool {
        self == Self::Scan
    }
}

/// Result of classifying a trigger string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Classification {
    Recognized { intent: ParsedIntent },
    Unrecognized,
}

impl Classification {
    pub fn intent(&self) -> Option<&ParsedIntent> {
        match self {
            Self::Recognized { intent } => Some(intent),
            Self::Unrecognized => None,
        }
    }

    /// Convert into a result, treating `Unrecognized` as [`IntentError::InvalidFormat`].
    pub fn into_result(self, input: &str) -> Result<ParsedIntent> {
        match self {
            Self::Recognized { intent } => Ok(intent),
            Self::Unrecognized => Err(invalid_format(input)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RULES
// ═══════════════════════════════════════════════════════════════════════════════

struct IntentRule {
    name: &'static str,
    bare_id: bool,
    extract: fn(&str) -> Option<ParsedIntent>,
}

const RULES: [IntentRule; 5] = [
    IntentRule {
        name: "transfer_universal_link",
        bare_id: false,
        extract: transfer_universal_link,
    },
    IntentRule {
        name: "payment_universal_link",
        bare_id: false,
        extract: payment_universal_link,
    },
    IntentRule {
        name: "app_scheme_payment",
        bare_id: false,
        extract: app_scheme_payment,
    },
    IntentRule {
        name: "legacy_transfer_link",
        bare_id: false,
        extract: legacy_transfer_link,
    },
    IntentRule {
        name: "bare_token_id",
        bare_id: true,
        extract: bare_token_id,
    },
];

/// Classify a camera payload; every rule applies.
pub fn parse(input: &str) -> Classification {
    classify(input, TriggerSource::Scan)
}

/// Classify `input` with the rules that apply to `source`.
pub fn classify(input: &str, source: TriggerSource) -> Classification {
    let rules = RULES
        .iter()
        .filter(|rule| !rule.bare_id || source.accepts_bare_id());

    for rule in rules {
        if let Some(intent) = (rule.extract)(input) {
            tracing::debug!(
                rule = rule.name,
                kind = %intent.kind(),
                id = intent.id(),
                ?source,
                "classified trigger"
            );
            return Classification::Recognized { intent };
        }
    }

    tracing::debug!(?source, len = input.len(), "unrecognized trigger");
    Classification::Unrecognized
}

/// Whether `id` is a well-formed intent id.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn path_id(candidate: &str) -> Option<&str> {
    is_valid_id(candidate).then_some(candidate)
}

/// Split `https://<host>/...` into host and path, requiring an exact host match.
fn https_path<'a>(input: &'a str, hosts: [&str; 2]) -> Option<&'a str> {
    let rest = input.strip_prefix("https://")?;
    let (host, path) = rest.split_at(rest.find('/')?);
    hosts.contains(&host).then_some(path)
}

fn transfer_universal_link(input: &str) -> Option<ParsedIntent> {
    let path = https_path(input, [TRANSFER_HOST, TRANSFER_DEV_HOST])?;
    let id = path_id(path.strip_prefix(PAY_PATH)?)?;
    Some(TransferTokenIntent::new(id).into())
}

fn payment_universal_link(input: &str) -> Option<ParsedIntent> {
    let path = https_path(input, [PAYMENT_HOST, PAYMENT_DEV_HOST])?;
    let id = path_id(path.strip_prefix(PAY_PATH)?)?;
    Some(PaymentIntent::new(id).into())
}

fn app_scheme_payment(input: &str) -> Option<ParsedIntent> {
    let rest = input
        .strip_prefix(APP_SCHEME)?
        .strip_prefix("://payment/")?;
    let (id, query) = match rest.split_once('?') {
        Some((id, query)) => (id, Some(query)),
        None => (rest, None),
    };
    let id = path_id(id)?;

    let source_browser = query.and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == SOURCE_BROWSER_PARAM)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    });

    Some(ParsedIntent::Payment(PaymentIntent {
        request_id: id.to_string(),
        source_browser,
    }))
}

fn legacy_transfer_link(input: &str) -> Option<ParsedIntent> {
    let rest = input
        .strip_prefix(LEGACY_TRANSFER_SCHEME)?
        .strip_prefix("://pay/")?;
    let id = path_id(rest)?;
    Some(TransferTokenIntent::new(id).into())
}

fn bare_token_id(input: &str) -> Option<ParsedIntent> {
    let id = path_id(input)?;
    Some(TransferTokenIntent::new(id).into())
}

/// `InvalidFormat` carrying at most 64 characters of the input.
pub(crate) fn invalid_format(input: &str) -> IntentError {
    const MAX: usize = 64;
    let shown = match input.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_string(),
    };
    IntentError::InvalidFormat(shown)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINK GENERATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Which host family generated links point at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkEnvironment {
    #[default]
    Production,
    Development,
}

impl LinkEnvironment {
    pub fn transfer_host(self) -> &'static str {
        match self {
            Self::Production => TRANSFER_HOST,
            Self::Development => TRANSFER_DEV_HOST,
        }
    }

    pub fn payment_host(self) -> &'static str {
        match self {
            Self::Production => PAYMENT_HOST,
            Self::Development => PAYMENT_DEV_HOST,
        }
    }
}

impl TransferTokenIntent {
    /// Universal link encoded in receive QR codes.
    pub fn universal_link(&self, env: LinkEnvironment) -> String {
        format!("https://{}{}{}", env.transfer_host(), PAY_PATH, self.token_id)
    }
}

impl PaymentIntent {
    /// Universal link a merchant checkout opens.
    pub fn universal_link(&self, env: LinkEnvironment) -> String {
        format!("https://{}{}{}", env.payment_host(), PAY_PATH, self.request_id)
    }

    /// Custom-scheme link, carrying the source browser when known.
    pub fn app_link(&self) -> String {
        let mut link = format!("{}://payment/{}", APP_SCHEME, self.request_id);
        if let Some(ref browser) = self.source_browser {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair(SOURCE_BROWSER_PARAM, browser)
                .finish();
            link.push('?');
            link.push_str(&query);
        }
        link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognized(input: &str, source: TriggerSource) -> ParsedIntent {
        match classify(input, source) {
            Classification::Recognized { intent } => intent,
            Classification::Unrecognized => panic!("expected {input} to be recognized"),
        }
    }

    #[test]
    fn test_recognized_formats() {
        let cases: [(&str, ParsedIntent); 7] = [
            (
                "https://transfer.banksim.ca/pay/tok_1",
                TransferTokenIntent::new("tok_1").into(),
            ),
            (
                "https://transfersim-dev.banksim.ca/pay/tok-2",
                TransferTokenIntent::new("tok-2").into(),
            ),
            (
                "https://wsim.banksim.ca/pay/abc123",
                PaymentIntent::new("abc123").into(),
            ),
            (
                "https://wsim-dev.banksim.ca/pay/abc123",
                PaymentIntent::new("abc123").into(),
            ),
            (
                "mwsim://payment/req_9?sourceBrowser=Safari",
                PaymentIntent::new("req_9").with_source_browser("Safari").into(),
            ),
            ("mwsim://payment/req_9", PaymentIntent::new("req_9").into()),
            ("tsim://pay/legacy1", TransferTokenIntent::new("legacy1").into()),
        ];

        for (input, expected) in cases {
            assert_eq!(recognized(input, TriggerSource::DeepLink), expected, "{input}");
            assert_eq!(recognized(input, TriggerSource::Scan), expected, "{input}");
        }
    }

    #[test]
    fn test_bare_id_only_from_scan() {
        assert_eq!(
            recognized("tok_1", TriggerSource::Scan),
            TransferTokenIntent::new("tok_1").into()
        );
        assert_eq!(
            classify("tok_1", TriggerSource::DeepLink),
            Classification::Unrecognized
        );
        assert_eq!(
            classify("tok_1", TriggerSource::Notification),
            Classification::Unrecognized
        );
    }

    #[test]
    fn test_near_misses_are_unrecognized() {
        let near_misses = [
            "",
            "https://wsim.banksim.ca/pay/",
            "https://wsim.banksim.ca/pay/abc/extra",
            "https://wsim.banksim.ca/pay/abc?utm=1",
            "https://WSIM.banksim.ca/pay/abc",
            "HTTPS://wsim.banksim.ca/pay/abc",
            "http://wsim.banksim.ca/pay/abc",
            "xhttps://wsim.banksim.ca/pay/abc",
            "https://wsim.banksim.ca.evil.example/pay/abc",
            "https://evil.example/https://wsim.banksim.ca/pay/abc",
            "https://transfer-dev.banksim.ca/pay/abc",
            "https://wsimsim-dev.banksim.ca/pay/abc",
            "https://wsim.banksim.ca/checkout/abc",
            "Mwsim://payment/abc",
            "mwsim://payments/abc",
            "mwsim://payment/a.b",
            "tsim://transfer/abc",
            "tsim://pay/abc def",
            "tok 1",
            "tok_1\n",
        ];

        for input in near_misses {
            assert_eq!(parse(input), Classification::Unrecognized, "{input:?}");
        }
    }

    #[test]
    fn test_source_browser_edge_cases() {
        assert_eq!(
            recognized("mwsim://payment/r1?sourceBrowser=", TriggerSource::DeepLink),
            PaymentIntent::new("r1").into()
        );
        assert_eq!(
            recognized(
                "mwsim://payment/r1?foo=bar&sourceBrowser=Chrome%20Beta",
                TriggerSource::DeepLink
            ),
            PaymentIntent::new("r1").with_source_browser("Chrome Beta").into()
        );
    }

    #[test]
    fn test_rule_precedence_order() {
        let names: Vec<_> = RULES.iter().map(|rule| rule.name).collect();
        assert_eq!(
            names,
            [
                "transfer_universal_link",
                "payment_universal_link",
                "app_scheme_payment",
                "legacy_transfer_link",
                "bare_token_id",
            ]
        );
        assert!(RULES.iter().filter(|rule| rule.bare_id).count() == 1);
    }

    #[test]
    fn test_unrecognized_into_result() {
        let err = parse("nope://x").into_result("nope://x").unwrap_err();
        assert!(matches!(err, IntentError::InvalidFormat(_)));
    }

    #[test]
    fn test_link_generation() {
        let token = TransferTokenIntent::new("tok_7");
        assert_eq!(
            token.universal_link(LinkEnvironment::Production),
            "https://transfer.banksim.ca/pay/tok_7"
        );
        assert_eq!(
            token.universal_link(LinkEnvironment::Development),
            "https://transfersim-dev.banksim.ca/pay/tok_7"
        );

        let payment = PaymentIntent::new("r2").with_source_browser("Firefox Focus");
        assert_eq!(
            payment.app_link(),
            "mwsim://payment/r2?sourceBrowser=Firefox+Focus"
        );
        assert_eq!(
            recognized(&payment.app_link(), TriggerSource::DeepLink),
            payment.clone().into()
        );
    }
}
