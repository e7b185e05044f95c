//! Approval, cancellation, retry and expiry of resolved intents.

use std::time::Duration;

use chrono::Utc;
use mwsim_intents::{
    BackendError, ErrorKind, IntentError, IntentKind, PaymentApproval, PaymentOutcome,
    ResolutionState, StateUpdate, TriggerDispatch,
};
use mwsim_test_fixtures::{
    sample_payment_request, sample_transfer_token, sample_transfer_token_expiring, BackendCall,
    ObservedEvent, TestHarness, DEFAULT_CARD_ID, MERCHANT_RETURN_URL, SECOND_CARD_ID,
};

async fn ready_payment(h: &TestHarness, link: &str, request_id: &str) {
    h.backend.with_payment(request_id);
    let dispatch = h.engine.request_deep_link(link).await.unwrap();
    assert!(matches!(
        dispatch,
        TriggerDispatch::Resolution(StateUpdate::Payment(ResolutionState::Ready(_)))
    ));
}

#[tokio::test]
async fn approval_returns_outcome_with_source_browser() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "mwsim://payment/req_1?sourceBrowser=Safari", "req_1").await;

    let state = h.engine.approve_payment(SECOND_CARD_ID).await.unwrap();

    assert_eq!(
        state,
        ResolutionState::Success(PaymentOutcome {
            request_id: "req_1".into(),
            card_id: SECOND_CARD_ID.into(),
            return_url: Some(MERCHANT_RETURN_URL.into()),
            source_browser: Some("Safari".into()),
        })
    );
    assert_eq!(
        h.backend.calls_matching(&BackendCall::ApprovePayment {
            request_id: "req_1".into(),
            card_id: SECOND_CARD_ID.into(),
        }),
        1
    );
    assert_eq!(h.store.load(IntentKind::Payment).unwrap(), None);
    assert_eq!(h.engine.expiry_deadline(IntentKind::Payment), None);
}

#[tokio::test]
async fn approval_return_url_overrides_request_url() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_2", "req_2").await;
    h.backend.script_approvals([Ok(PaymentApproval {
        return_url: Some("https://shop.example.com/thanks".into()),
    })]);

    let state = h.engine.approve_payment(DEFAULT_CARD_ID).await.unwrap();
    let ResolutionState::Success(outcome) = state else {
        panic!("expected success");
    };
    assert_eq!(
        outcome.return_url.as_deref(),
        Some("https://shop.example.com/thanks")
    );
    assert_eq!(outcome.source_browser, None);
}

#[tokio::test]
async fn ineligible_card_is_rejected_without_network_call() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_3", "req_3").await;

    let err = h.engine.approve_payment("card_unknown").await.unwrap_err();
    assert!(matches!(err, IntentError::UnknownCard(ref card) if card == "card_unknown"));
    assert!(h.engine.payment_state().is_ready());
    assert_eq!(h.backend.call_count(), 1);
}

#[tokio::test]
async fn approve_is_illegal_before_ready() {
    let h = TestHarness::signed_in();
    let err = h.engine.approve_payment(DEFAULT_CARD_ID).await.unwrap_err();
    assert!(matches!(err, IntentError::IllegalTransition(_)));
}

#[tokio::test]
async fn second_approve_while_approving_is_a_noop() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_4", "req_4").await;
    h.backend.hold();

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.approve_payment(DEFAULT_CARD_ID).await });
    h.backend.wait_for_calls(2).await;
    assert_eq!(h.engine.payment_state(), ResolutionState::Approving);

    let second = h.engine.approve_payment(DEFAULT_CARD_ID).await.unwrap();
    assert_eq!(second, ResolutionState::Approving);

    h.backend.release(1);
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, ResolutionState::Success(_)));
    assert_eq!(
        h.backend.calls_matching(&BackendCall::ApprovePayment {
            request_id: "req_4".into(),
            card_id: DEFAULT_CARD_ID.into(),
        }),
        1
    );
}

#[tokio::test]
async fn rejected_approval_with_terminal_error_clears_entry() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_5", "req_5").await;
    h.backend
        .script_approvals([Err(BackendError::AlreadyProcessed)]);

    let state = h.engine.approve_payment(DEFAULT_CARD_ID).await.unwrap();
    assert_eq!(state.error_kind(), Some(ErrorKind::AlreadyProcessed));
    assert!(!state.error().unwrap().retryable);
    assert_eq!(h.store.load(IntentKind::Payment).unwrap(), None);
    assert_eq!(h.engine.expiry_deadline(IntentKind::Payment), None);
}

#[tokio::test]
async fn offline_approval_keeps_the_countdown() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_5b", "req_5b").await;
    let deadline = h.engine.expiry_deadline(IntentKind::Payment);
    assert!(deadline.is_some());
    h.backend
        .script_approvals([Err(BackendError::Network("offline".into()))]);

    let state = h.engine.approve_payment(DEFAULT_CARD_ID).await.unwrap();
    assert_eq!(state.error_kind(), Some(ErrorKind::Network));
    assert_eq!(h.engine.expiry_deadline(IntentKind::Payment), deadline);
    assert!(h.store.load(IntentKind::Payment).unwrap().is_some());
}

#[tokio::test]
async fn cancel_closes_locally_then_tells_backend() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_6", "req_6").await;

    h.engine.cancel_payment().await.unwrap();

    assert_eq!(h.engine.payment_state(), ResolutionState::Idle);
    assert_eq!(h.store.load(IntentKind::Payment).unwrap(), None);
    assert_eq!(
        h.backend
            .calls_matching(&BackendCall::CancelPayment("req_6".into())),
        1
    );
    assert_eq!(
        h.observer.resolved().last(),
        Some(&StateUpdate::Payment(ResolutionState::Idle))
    );

    // Nothing active: nothing to cancel.
    h.engine.cancel_payment().await.unwrap();
    assert_eq!(
        h.backend
            .calls_matching(&BackendCall::CancelPayment("req_6".into())),
        1
    );
}

#[tokio::test]
async fn failed_backend_cancel_is_reported_after_local_close() {
    let h = TestHarness::signed_in();
    ready_payment(&h, "https://wsim.banksim.ca/pay/req_7", "req_7").await;
    h.backend
        .fail_cancel(BackendError::Network("offline".into()));

    let err = h.engine.cancel_payment().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Network));
    assert_eq!(h.engine.payment_state(), ResolutionState::Idle);
    assert_eq!(h.store.load(IntentKind::Payment).unwrap(), None);
}

#[tokio::test]
async fn response_after_close_is_dropped() {
    let h = TestHarness::signed_in();
    h.backend.with_payment("req_8");
    h.backend.hold();

    let engine = h.engine.clone();
    let task = tokio::spawn(async move {
        engine
            .request_deep_link("https://wsim.banksim.ca/pay/req_8")
            .await
    });
    h.backend.wait_for_calls(1).await;

    assert_eq!(h.engine.close_payment().as_deref(), Some("req_8"));
    assert_eq!(h.store.load(IntentKind::Payment).unwrap(), None);

    h.backend.release(1);
    task.await.unwrap().unwrap();

    assert_eq!(h.engine.payment_state(), ResolutionState::Idle);
    assert_eq!(h.engine.expiry_deadline(IntentKind::Payment), None);
    assert_eq!(
        h.observer.resolved(),
        [StateUpdate::Payment(ResolutionState::Idle)]
    );
}

#[tokio::test]
async fn stale_response_never_overwrites_newer_ready_state() {
    let h = TestHarness::signed_in();
    h.backend
        .script_token("tok_old", [Err(BackendError::Expired)]);
    h.backend.with_token("tok_new");

    let old_gate = h.backend.hold();
    let engine = h.engine.clone();
    let old = tokio::spawn(async move { engine.request_deep_link("tsim://pay/tok_old").await });
    h.backend.wait_for_calls(1).await;

    h.backend.hold();
    let engine = h.engine.clone();
    let new = tokio::spawn(async move { engine.request_deep_link("tsim://pay/tok_new").await });
    h.backend.wait_for_calls(2).await;

    h.backend.release(1);
    new.await.unwrap().unwrap();
    assert!(h.engine.transfer_state().is_ready());

    old_gate.add_permits(1);
    old.await.unwrap().unwrap();

    let state = h.engine.transfer_state();
    assert_eq!(state.data().unwrap().token_id, "tok_new");
    assert!(h
        .observer
        .resolved()
        .iter()
        .all(|update| update.error_kind().is_none()));
}

#[tokio::test]
async fn retry_re_resolves_after_transient_error() {
    let h = TestHarness::signed_in();
    h.backend.script_token(
        "tok_r",
        [
            Err(BackendError::Network("offline".into())),
            Ok(sample_transfer_token("tok_r")),
        ],
    );

    h.engine
        .request_deep_link("https://transfer.banksim.ca/pay/tok_r")
        .await
        .unwrap();
    assert!(h.engine.transfer_state().error().unwrap().retryable);

    let update = h.engine.retry(IntentKind::TransferToken).await.unwrap();
    assert!(update.is_ready());
    assert_eq!(
        h.backend
            .calls_matching(&BackendCall::ResolveTransferToken("tok_r".into())),
        2
    );
}

#[tokio::test]
async fn unknown_error_allows_exactly_one_retry() {
    let h = TestHarness::signed_in();
    h.backend.script_payment(
        "req_u",
        [Err(BackendError::Other("internal".into()))],
    );

    h.engine
        .request_deep_link("https://wsim.banksim.ca/pay/req_u")
        .await
        .unwrap();
    let update = h.engine.retry(IntentKind::Payment).await.unwrap();
    assert_eq!(update.error_kind(), Some(ErrorKind::Unknown));

    let err = h.engine.retry(IntentKind::Payment).await.unwrap_err();
    assert!(matches!(err, IntentError::IllegalTransition(_)));
    // Unknown is not terminal: the entry waits for recovery.
    assert!(h.store.load(IntentKind::Payment).unwrap().is_some());
}

#[tokio::test]
async fn complete_transfer_closes_ready_token() {
    let h = TestHarness::signed_in();
    assert!(h.engine.complete_transfer().is_err());

    h.backend.with_token("tok_c");
    h.engine
        .request_deep_link("https://transfer.banksim.ca/pay/tok_c")
        .await
        .unwrap();

    assert_eq!(h.engine.complete_transfer().unwrap(), "tok_c");
    assert_eq!(h.engine.transfer_state(), ResolutionState::Idle);
    assert_eq!(h.store.load(IntentKind::TransferToken).unwrap(), None);
}

#[tokio::test]
async fn expiry_fires_once_and_survives_same_deadline_refetch() {
    let h = TestHarness::signed_in();
    let past = Utc::now() - chrono::Duration::seconds(1);
    h.backend
        .script_token("tok_e", [Ok(sample_transfer_token_expiring("tok_e", past))]);

    h.engine
        .request_deep_link("https://transfer.banksim.ca/pay/tok_e")
        .await
        .unwrap();
    h.observer
        .wait_until(|events| events.contains(&ObservedEvent::Expired(IntentKind::TransferToken)))
        .await;
    assert_eq!(h.engine.expiry_deadline(IntentKind::TransferToken), Some(past));

    // Same expiresAt: the fired timer is kept, so no second expiry.
    h.engine
        .request_deep_link("https://transfer.banksim.ca/pay/tok_e")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.observer
            .count(&ObservedEvent::Expired(IntentKind::TransferToken)),
        1
    );

    // A refreshed token gets a fresh timer.
    let refreshed = past + chrono::Duration::milliseconds(500);
    h.backend.script_token(
        "tok_e",
        [Ok(sample_transfer_token_expiring("tok_e", refreshed))],
    );
    h.engine
        .request_deep_link("https://transfer.banksim.ca/pay/tok_e")
        .await
        .unwrap();
    h.observer
        .wait_until(|events| {
            events
                .iter()
                .filter(|event| **event == ObservedEvent::Expired(IntentKind::TransferToken))
                .count()
                == 2
        })
        .await;
    assert!(h
        .observer
        .progress()
        .iter()
        .all(|(kind, fraction)| *kind == IntentKind::TransferToken && *fraction == 0.0));
}

#[tokio::test]
async fn live_payment_reports_expiry_progress() {
    let h = TestHarness::signed_in();
    h.backend
        .script_payment("req_p", [Ok(sample_payment_request("req_p"))]);

    h.engine
        .request_deep_link("https://wsim.banksim.ca/pay/req_p")
        .await
        .unwrap();
    for _ in 0..100 {
        if !h.observer.progress().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let progress = h.observer.progress();
    let (kind, fraction) = progress[0];
    assert_eq!(kind, IntentKind::Payment);
    assert!(fraction > 0.9 && fraction <= 1.0);
    assert!(h.observer.count(&ObservedEvent::Expired(IntentKind::Payment)) == 0);
}
