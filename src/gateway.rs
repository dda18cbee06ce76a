//! The quota-enforced proxy pipeline.
//!
//! `authenticate -> price -> reserve -> dispatch -> settle`. Both proxy routes
//! run through [`process`]; they differ only in the [`ProviderKind`] passed.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::providers::CompletionService;
use crate::providers::types::{PricedRequest, ProviderKind, ProviderParams};
use crate::quota::{self, AuditEntry, AuditStatus, Reservation, UnitKind, Units, UserQuota};

pub const QUOTA_UNITS_HEADER: &str = "x-quota-units";
pub const QUOTA_CONSUMED_HEADER: &str = "x-quota-consumed";
pub const QUOTA_LIMIT_HEADER: &str = "x-quota-limit";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A successfully proxied and metered request.
#[derive(Debug)]
pub struct ProxyOutcome {
    pub request_id: String,
    pub payload: Value,
    pub charged: Units,
    pub quota: UserQuota,
}

impl ProxyOutcome {
    fn kind(&self) -> UnitKind {
        self.charged.kind()
    }
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (QUOTA_UNITS_HEADER, self.charged.to_string()),
            (QUOTA_CONSUMED_HEADER, self.quota.consumed(kind).to_string()),
            (QUOTA_LIMIT_HEADER, self.quota.limit(kind).to_string()),
            (REQUEST_ID_HEADER, self.request_id.clone()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        (headers, Json(self.payload)).into_response()
    }
}

/// Run one request through the pipeline for an already authenticated user.
///
/// Parsing and pricing happen on the caller's future. Everything from the
/// reservation onwards runs in its own task, so a caller hanging up can
/// neither strand a reservation nor leave upstream usage unmetered. A denied
/// request never reaches the provider.
pub async fn process(
    state: &AppState,
    user: &AuthUser,
    kind: ProviderKind,
    body: Value,
    request_id: String,
) -> Result<ProxyOutcome, AppError> {
    let params = ProviderParams::from_body(kind, body)?;
    let provider = state.providers.get(kind)?;
    let cost = state.cost_model.cost(&params)?;
    let model = provider.model(&params);

    let request = PricedRequest {
        request_id,
        user_id: user.user_id.clone(),
        params,
        cost,
    };

    let task = tokio::spawn(admit_and_dispatch(state.clone(), provider, request, model));
    task.await
        .map_err(|e| AppError::Internal(format!("dispatch task failed: {e}")))?
}

async fn admit_and_dispatch(
    state: AppState,
    provider: Arc<dyn CompletionService>,
    request: PricedRequest,
    model: String,
) -> Result<ProxyOutcome, AppError> {
    let reservation = {
        let user_id = request.user_id.clone();
        let cost = request.cost;
        quota::blocking(&state.ledger, move |ledger| ledger.reserve(&user_id, &cost)).await?
    };

    match reservation {
        Reservation::Granted(granted) => {
            dispatch_and_record(state, provider, request, model, granted).await
        }
        Reservation::Denied(exceeded) => {
            warn!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                provider = %provider.id(),
                consumed = exceeded.consumed,
                limit = exceeded.limit,
                requested = exceeded.requested,
                "Quota exceeded, rejecting request"
            );
            let _ = state.audit_tx.send(AuditEntry {
                user_id: request.user_id,
                request_id: request.request_id,
                provider: provider.id().to_string(),
                model,
                unit_kind: request.cost.kind(),
                units: exceeded.requested,
                latency_ms: 0,
                status: AuditStatus::Denied,
            });
            Err(AppError::QuotaExceeded(exceeded.to_string()))
        }
    }
}

async fn dispatch_and_record(
    state: AppState,
    provider: Arc<dyn CompletionService>,
    request: PricedRequest,
    model: String,
    granted: UserQuota,
) -> Result<ProxyOutcome, AppError> {
    let start = Instant::now();
    let result = provider.complete(&request).await;
    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let audit = |status: AuditStatus, units: f64| AuditEntry {
        user_id: request.user_id.clone(),
        request_id: request.request_id.clone(),
        provider: provider.id().to_string(),
        model: model.clone(),
        unit_kind: request.cost.kind(),
        units,
        latency_ms,
        status,
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                provider = %provider.id(),
                latency_ms,
                error = %err,
                "Upstream call failed"
            );
            if let Some(reserved) = request.cost.reserved() {
                if let Err(e) = state.recorder.release(&request.user_id, reserved).await {
                    error!(
                        user_id = %request.user_id,
                        request_id = %request.request_id,
                        units = %reserved,
                        error = %e,
                        "Failed to release reservation after upstream failure"
                    );
                }
            }
            let _ = state.audit_tx.send(audit(AuditStatus::UpstreamError, 0.0));
            return Err(AppError::from(err));
        }
    };

    let reported = response.usage;
    match state.recorder.settle(granted, request.cost, reported).await {
        Ok(settlement) => {
            let status = if settlement.unmetered {
                error!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    provider = %provider.id(),
                    model = %model,
                    latency_ms,
                    "Upstream call succeeded without a usage report, nothing was charged"
                );
                AuditStatus::Unrecorded
            } else {
                info!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    provider = %provider.id(),
                    model = %model,
                    units = %settlement.charged,
                    latency_ms,
                    "Request metered"
                );
                AuditStatus::Success
            };
            let _ = state
                .audit_tx
                .send(audit(status, settlement.charged.as_f64()));
            Ok(ProxyOutcome {
                request_id: request.request_id.clone(),
                payload: response.payload,
                charged: settlement.charged,
                quota: settlement.quota,
            })
        }
        Err(e) => {
            let units = reported
                .or(request.cost.reserved())
                .map(|u| u.as_f64())
                .unwrap_or(0.0);
            error!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                provider = %provider.id(),
                units,
                error = %e,
                "Upstream call succeeded but usage could not be recorded"
            );
            let _ = state.audit_tx.send(audit(AuditStatus::Unrecorded, units));
            Err(AppError::LedgerUnavailable(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::providers::types::ProviderResponse;
    use crate::quota::{LedgerError, QuotaLedger, QuotaLimits};
    use crate::test_support::{state_with, state_with_audit, test_user};
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted provider that counts invocations.
    struct Scripted {
        kind: ProviderKind,
        calls: AtomicUsize,
        delay: Duration,
        result: fn() -> Result<ProviderResponse, ProviderError>,
    }

    impl Scripted {
        fn new(kind: ProviderKind, result: fn() -> Result<ProviderResponse, ProviderError>) -> Arc<Self> {
            Self::slow(kind, result, Duration::ZERO)
        }

        fn slow(
            kind: ProviderKind,
            result: fn() -> Result<ProviderResponse, ProviderError>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                delay,
                result,
            })
        }
    }

    impl CompletionService for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn model(&self, _params: &ProviderParams) -> String {
            "scripted-model".into()
        }

        fn complete<'a>(
            &'a self,
            _request: &'a PricedRequest,
        ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + 'a>>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = (self.result)();
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            })
        }
    }

    fn image_ok() -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            payload: json!({"data": [{"b64_json": "AAAA"}]}),
            usage: None,
        })
    }

    fn text_50() -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            payload: json!({"usageMetadata": {"totalTokenCount": 50}}),
            usage: Some(Units::Text(50)),
        })
    }

    fn text_unreported() -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            payload: json!({"candidates": []}),
            usage: None,
        })
    }

    fn upstream_down() -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Api {
            status: 503,
            message: "unavailable".into(),
        })
    }

    fn image_body(size: &str, n: u32) -> Value {
        json!({"model": "dall-e-3", "prompt": "a lighthouse", "size": size, "n": n})
    }

    #[tokio::test]
    async fn test_image_request_reserves_cost() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let state = state_with(provider.clone());
        let user = test_user(&state, 4.0);

        let outcome = process(&state, &user, ProviderKind::Image, image_body("1024x1024", 2), "r1".into())
            .await
            .unwrap();

        assert_eq!(outcome.charged, Units::Image(0.08));
        assert!((state.ledger.get(&user.user_id).unwrap().image_units_consumed - 0.08).abs() < 1e-12);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_never_dispatches() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let state = state_with(provider.clone());
        let user = test_user(&state, 0.05);

        let err = process(&state, &user, ProviderKind::Image, image_body("1024x1792", 1), "r1".into())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::QuotaExceeded(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.ledger.get(&user.user_id).unwrap().image_units_consumed, 0.0);
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_consumed_unchanged() {
        let provider = Scripted::new(ProviderKind::Image, upstream_down);
        let state = state_with(provider);
        let user = test_user(&state, 4.0);
        state.ledger.record(&user.user_id, Units::Image(1.0)).unwrap();

        let err = process(&state, &user, ProviderKind::Image, image_body("1024x1024", 1), "r1".into())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UpstreamFailure(_)));
        assert!((state.ledger.get(&user.user_id).unwrap().image_units_consumed - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_text_overshoot_is_recorded() {
        let provider = Scripted::new(ProviderKind::Text, text_50);
        let state = state_with(provider);
        let user = test_user(&state, 4.0);
        state
            .ledger
            .set_limits(
                &user.user_id,
                QuotaLimits {
                    text_unit_limit: 1000,
                    image_unit_limit: 4.0,
                },
            )
            .unwrap();
        state.ledger.record(&user.user_id, Units::Text(999)).unwrap();

        let outcome = process(&state, &user, ProviderKind::Text, json!({"contents": []}), "r1".into())
            .await
            .unwrap();
        assert_eq!(outcome.quota.text_units_consumed, 1049);

        let err = process(&state, &user, ProviderKind::Text, json!({"contents": []}), "r2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_unsupported_configuration_never_dispatches() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let state = state_with(provider.clone());
        let user = test_user(&state, 4.0);

        let err = process(&state, &user, ProviderKind::Image, image_body("64x64", 1), "r1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedConfiguration(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let state = state_with(provider);
        let ghost = AuthUser {
            user_id: "ghost".into(),
            name: "ghost".into(),
            role: "member".into(),
        };

        let err = process(&state, &ghost, ProviderKind::Image, image_body("1024x1024", 1), "r1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_image_requests_respect_limit() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let state = state_with(provider);
        let user = test_user(&state, 4.0);

        // dall-e-3 1024x1792 at n=25 costs 2.0 units.
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let state = state.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    process(&state, &user, ProviderKind::Image, image_body("1024x1792", 25), format!("r{i}")).await
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 2);
        let consumed = state.ledger.get(&user.user_id).unwrap().image_units_consumed;
        assert!(consumed <= 4.0 + 1e-9);
    }

    /// Ledger that admits everything but cannot write.
    struct ReadOnlyLedger(quota::MemoryLedger);

    impl QuotaLedger for ReadOnlyLedger {
        fn backend(&self) -> &'static str {
            "read-only"
        }
        fn get(&self, user_id: &str) -> Result<UserQuota, LedgerError> {
            self.0.get(user_id)
        }
        fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
            self.0.provision(user_id, limits)
        }
        fn set_limits(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
            self.0.set_limits(user_id, limits)
        }
        fn reserve(&self, user_id: &str, cost: &quota::Cost) -> Result<Reservation, LedgerError> {
            self.0.reserve(user_id, cost)
        }
        fn record(&self, _user_id: &str, _units: Units) -> Result<UserQuota, LedgerError> {
            Err(LedgerError::Unavailable("disk full".into()))
        }
        fn release(&self, _user_id: &str, _units: Units) -> Result<UserQuota, LedgerError> {
            Err(LedgerError::Unavailable("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_after_success_is_reported() {
        let provider = Scripted::new(ProviderKind::Text, text_50);
        let mut state = state_with(provider);
        let ledger: Arc<dyn QuotaLedger> = Arc::new(ReadOnlyLedger(quota::MemoryLedger::new()));
        state.ledger = Arc::clone(&ledger);
        state.recorder = quota::UsageRecorder::new(ledger);
        let user = test_user(&state, 4.0);

        let err = process(&state, &user, ProviderKind::Text, json!({}), "r1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LedgerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_usage_report_is_audited_as_unrecorded() {
        let provider = Scripted::new(ProviderKind::Text, text_unreported);
        let (state, mut audit_rx) = state_with_audit(provider);
        let user = test_user(&state, 4.0);

        let outcome = process(&state, &user, ProviderKind::Text, json!({"contents": []}), "r1".into())
            .await
            .unwrap();
        assert_eq!(outcome.charged, Units::Text(0));
        assert_eq!(outcome.payload, json!({"candidates": []}));

        let entry = audit_rx.try_recv().unwrap();
        assert_eq!(entry.status, AuditStatus::Unrecorded);
        assert_eq!(entry.request_id, "r1");
        assert_eq!(entry.unit_kind, UnitKind::Text);
    }

    #[tokio::test]
    async fn test_caller_gone_during_dispatch_still_meters() {
        let provider = Scripted::slow(ProviderKind::Text, text_50, Duration::from_millis(200));
        let (state, mut audit_rx) = state_with_audit(provider.clone());
        let user = test_user(&state, 4.0);

        let call = process(&state, &user, ProviderKind::Text, json!({"contents": []}), "r1".into());
        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.ledger.get(&user.user_id).unwrap().text_units_consumed, 50);
        assert_eq!(audit_rx.try_recv().unwrap().status, AuditStatus::Success);
    }

    /// Memory ledger whose reservations stall, standing in for a contended database.
    struct SlowReserveLedger(quota::MemoryLedger);

    impl QuotaLedger for SlowReserveLedger {
        fn backend(&self) -> &'static str {
            "slow"
        }
        fn get(&self, user_id: &str) -> Result<UserQuota, LedgerError> {
            self.0.get(user_id)
        }
        fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
            self.0.provision(user_id, limits)
        }
        fn set_limits(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
            self.0.set_limits(user_id, limits)
        }
        fn reserve(&self, user_id: &str, cost: &quota::Cost) -> Result<Reservation, LedgerError> {
            std::thread::sleep(Duration::from_millis(200));
            self.0.reserve(user_id, cost)
        }
        fn record(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
            self.0.record(user_id, units)
        }
        fn release(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
            self.0.release(user_id, units)
        }
    }

    #[tokio::test]
    async fn test_caller_gone_during_reserve_never_strands_reservation() {
        let provider = Scripted::new(ProviderKind::Image, image_ok);
        let (mut state, mut audit_rx) = state_with_audit(provider.clone());
        let ledger: Arc<dyn QuotaLedger> = Arc::new(SlowReserveLedger(quota::MemoryLedger::new()));
        state.ledger = Arc::clone(&ledger);
        state.recorder = quota::UsageRecorder::new(ledger);
        let user = test_user(&state, 4.0);

        let call = process(&state, &user, ProviderKind::Image, image_body("1024x1024", 1), "r1".into());
        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());

        // The reservation went on to dispatch and settle without the caller.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let consumed = state.ledger.get(&user.user_id).unwrap().image_units_consumed;
        assert!((consumed - 0.04).abs() < 1e-12);
        assert_eq!(audit_rx.try_recv().unwrap().status, AuditStatus::Success);
    }
}
