//! Collaborator boundaries: the backend resolver and the session provider.
//!
//! Wire format and transport belong to the implementor. Upstream failures are
//! reported as [`BackendError`], typically built with
//! [`BackendError::from_upstream`].

use async_trait::async_trait;

use crate::{BackendError, PaymentApproval, ResolvedPaymentRequest, ResolvedTransferToken};

/// Typed request/response view of the wallet backend.
#[async_trait]
pub trait IntentBackend: Send + Sync {
    /// Fetch the full details of a merchant payment request.
    async fn get_payment_details(
        &self,
        request_id: &str,
    ) -> Result<ResolvedPaymentRequest, BackendError>;

    /// Approve a payment request with one of its eligible cards.
    async fn approve_payment(
        &self,
        request_id: &str,
        card_id: &str,
    ) -> Result<PaymentApproval, BackendError>;

    /// Tell the backend the user declined the payment request.
    async fn cancel_payment(&self, request_id: &str) -> Result<(), BackendError>;

    /// Resolve a transfer token into its recipient.
    async fn resolve_transfer_token(
        &self,
        token_id: &str,
    ) -> Result<ResolvedTransferToken, BackendError>;
}

/// Answers whether the user currently has a valid session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn is_authenticated(&self) -> Result<bool, BackendError>;
}
