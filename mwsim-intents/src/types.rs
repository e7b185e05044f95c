//! Core types for payment and transfer intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// INTENT KINDS
// ═══════════════════════════════════════════════════════════════════════════════

/// The two canonical intents every trigger normalizes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Merchant checkout payment request.
    Payment,
    /// P2P or micro-merchant receive token.
    TransferToken,
}

impl IntentKind {
    /// Every kind, in recovery order.
    pub const ALL: [IntentKind; 2] = [IntentKind::Payment, IntentKind::TransferToken];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::TransferToken => "transfer_token",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merchant checkout payment request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Opaque id taken from the link path.
    pub request_id: String,
    /// Browser that opened the app, so approval can hand control back to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_browser: Option<String>,
}

impl PaymentIntent {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            source_browser: None,
        }
    }

    pub fn with_source_browser(mut self, browser: impl Into<String>) -> Self {
        self.source_browser = Some(browser.into());
        self
    }
}

/// A P2P or merchant receive token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTokenIntent {
    pub token_id: String,
}

impl TransferTokenIntent {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
        }
    }
}

/// A classified trigger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedIntent {
    Payment(PaymentIntent),
    TransferToken(TransferTokenIntent),
}

impl ParsedIntent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::Payment(_) => IntentKind::Payment,
            Self::TransferToken(_) => IntentKind::TransferToken,
        }
    }

    /// The id the backend resolves.
    pub fn id(&self) -> &str {
        match self {
            Self::Payment(intent) => &intent.request_id,
            Self::TransferToken(intent) => &intent.token_id,
        }
    }
}

impl From<PaymentIntent> for ParsedIntent {
    fn from(intent: PaymentIntent) -> Self {
        Self::Payment(intent)
    }
}

impl From<TransferTokenIntent> for ParsedIntent {
    fn from(intent: TransferTokenIntent) -> Self {
        Self::TransferToken(intent)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOLVED PAYMENT REQUEST
// ═══════════════════════════════════════════════════════════════════════════════

/// A card the user may pay this request with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleCard {
    pub card_id: String,
    pub display_name: String,
    pub last_four: String,
    /// Card network label (e.g. "VISA").
    pub network: String,
    #[serde(default)]
    pub is_default: bool,
}

/// One line of a merchant order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_amount_cents: u64,
}

/// Structured order details attached by the merchant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(default)]
    pub items: Vec<OrderLineItem>,
    pub subtotal_cents: Option<u64>,
    pub tax_cents: Option<u64>,
    pub shipping_cents: Option<u64>,
}

/// Full details of a merchant payment request.
///
/// Immutable once fetched; a re-fetch replaces it wholesale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPaymentRequest {
    pub request_id: String,
    /// Amount in minor units of `currency`.
    pub amount_cents: u64,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_name: String,
    #[serde(default)]
    pub merchant_logo_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub cards: Vec<EligibleCard>,
    #[serde(default)]
    pub order_details: Option<OrderDetails>,
    #[serde(default)]
    pub return_url: Option<String>,
}

impl ResolvedPaymentRequest {
    /// The card to preselect: the default one, else the first eligible one.
    pub fn default_card(&self) -> Option<&EligibleCard> {
        self.cards
            .iter()
            .find(|card| card.is_default)
            .or_else(|| self.cards.first())
    }

    pub fn card(&self, card_id: &str) -> Option<&EligibleCard> {
        self.cards.iter().find(|card| card.card_id == card_id)
    }
}

/// Backend response to an approval.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentApproval {
    #[serde(default)]
    pub return_url: Option<String>,
}

/// Terminal success of a payment intent, as shown to the view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub request_id: String,
    pub card_id: String,
    /// Merchant return URL from the approval, falling back to the request's.
    pub return_url: Option<String>,
    pub source_browser: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOLVED TRANSFER TOKEN
// ═══════════════════════════════════════════════════════════════════════════════

/// Who receives money through a transfer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Individual,
    Merchant,
}

/// Recipient details behind a transfer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTransferToken {
    pub token_id: String,
    pub recipient_alias: String,
    pub recipient_display_name: String,
    pub recipient_bank_name: String,
    pub recipient_kind: RecipientKind,
    /// Fixed amount requested by the recipient, in minor units.
    #[serde(default)]
    pub amount_cents: Option<u64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl ResolvedTransferToken {
    pub fn is_merchant(&self) -> bool {
        self.recipient_kind == RecipientKind::Merchant
    }

    /// Whether the sender must type an amount.
    pub fn requires_amount(&self) -> bool {
        self.amount_cents.is_none()
    }
}
