//! Router tests over the in-memory store and the mock provider
//!
//! Tests cover:
//! - Admission chain (auth, rate limit, usage quota, response headers)
//! - Error mapping of payment preconditions and provider failures
//! - Webhook delivery, replay and signature rejection

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agora_billing::mock::MockProvider;
    use agora_billing::webhooks::signature_header;
    use agora_billing::{
        BillingConfig, BillingService, PaymentSettings, PriceIds, ProviderError, RateLimitConfig,
        StripeConfig, TierLimit,
    };
    use agora_shared::{
        BillingPlan, BillingStore, LedgerEntryType, MemoryStore, MemoryWindowCounter, Offering,
        OfferingPrice, PriceType, Principal, PrincipalSubscriptionSync, SubscriptionStatus,
        SubscriptionTier,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
        Router,
    };
    use serde_json::{json, Value};
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    use crate::routes::create_router;
    use crate::state::AppState;

    const JWT_SECRET: &str = "router-test-secret-at-least-32-bytes";
    const WEBHOOK_SECRET: &str = "whsec_router_test";

    struct TestApp {
        app: Router,
        state: AppState,
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
    }

    fn payments_config() -> BillingConfig {
        BillingConfig {
            stripe: Some(StripeConfig {
                secret_key: "sk_test_router".to_string(),
                webhook_secret: WEBHOOK_SECRET.to_string(),
                settings: PaymentSettings {
                    price_ids: PriceIds {
                        pro: Some("price_pro".to_string()),
                        enterprise: None,
                    },
                    ..PaymentSettings::default()
                },
            }),
            settings: PaymentSettings {
                price_ids: PriceIds {
                    pro: Some("price_pro".to_string()),
                    enterprise: None,
                },
                ..PaymentSettings::default()
            },
            ..BillingConfig::default()
        }
    }

    fn test_app_with(config: BillingConfig, with_provider: bool) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let billing = BillingService::new(
            config,
            store.clone(),
            Arc::new(MemoryWindowCounter::new()),
            with_provider.then(|| provider.clone() as Arc<dyn agora_billing::PaymentProvider>),
        );
        let state = AppState::new(Arc::new(billing), JWT_SECRET);
        TestApp {
            app: create_router(state.clone()),
            state,
            store,
            provider,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(payments_config(), true)
    }

    impl TestApp {
        async fn principal(&self) -> (Principal, String) {
            let principal = self
                .state
                .billing
                .register_principal(&format!("{}@example.com", uuid::Uuid::new_v4()), None)
                .await
                .unwrap();
            let token = self
                .state
                .jwt_manager
                .issue(principal.id, Some(principal.email.clone()), Duration::hours(1))
                .unwrap();
            (principal, token)
        }

        async fn offering(&self, price_type: PriceType, amount: i64, payout: bool) -> Offering {
            let (creator, _) = self.principal().await;
            if payout {
                self.store
                    .set_payout_account_if_absent(creator.id, "acct_creator")
                    .await
                    .unwrap();
            }
            let offering = Offering::new(
                creator.id,
                "Travel Planner",
                OfferingPrice {
                    price_type,
                    amount,
                    currency: "usd".to_string(),
                    plan: BillingPlan::Monthly,
                },
            );
            self.store.insert_offering(&offering).await.unwrap();
            offering
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.unwrap()
        }
    }

    fn get(path: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(path: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook(payload: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/payments/webhook");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(payload.to_vec())).unwrap()
    }

    fn sign(payload: &[u8]) -> String {
        signature_header(
            payload,
            WEBHOOK_SECRET,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let response = app.send(get("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["payments_enabled"], true);
    }

    #[tokio::test]
    async fn test_authenticated_routes_require_token() {
        let app = test_app();
        for path in ["/payments/usage", "/payments/my/purchases", "/payments/subscription"] {
            let response = app.send(get(path, None)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_usage_headers_on_admitted_requests() {
        let app = test_app();
        let (_, token) = app.principal().await;

        let response = app.send(get("/payments/subscription", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-usage-count"), Some("1"));
        assert_eq!(header_str(&response, "x-usage-limit"), Some("10"));
        assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("10"));

        let response = app.send(get("/payments/usage", Some(&token))).await;
        assert_eq!(header_str(&response, "x-usage-count"), Some("2"));
        let body = body_json(response).await;
        assert_eq!(body["usage"], 2);
        assert_eq!(body["tier"], "free");
        assert_eq!(body["enforced"], true);
    }

    #[tokio::test]
    async fn test_free_quota_exhaustion_returns_429() {
        let app = test_app_with(
            BillingConfig {
                free_usage_limit: 2,
                ..payments_config()
            },
            true,
        );
        let (_, token) = app.principal().await;

        for _ in 0..2 {
            let response = app.send(get("/payments/usage", Some(&token))).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.send(get("/payments/usage", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["code"], "usage_limit_exceeded");
        assert_eq!(body["usage"], 2);
        assert_eq!(body["limit"], 2);
        assert!(body["resetDate"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn test_rate_limited_calls_still_count_toward_usage() {
        let app = test_app_with(
            BillingConfig {
                free_usage_limit: 100,
                rate_limits: RateLimitConfig {
                    free: TierLimit::new(2, 3600),
                    ..RateLimitConfig::default()
                },
                ..payments_config()
            },
            true,
        );
        let (principal, token) = app.principal().await;

        let mut codes = Vec::new();
        for _ in 0..3 {
            codes.push(app.send(get("/payments/usage", Some(&token))).await.status());
        }
        assert_eq!(
            codes,
            vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );

        let stored = app.store.get_principal(principal.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.usage_count, 3);
    }

    #[tokio::test]
    async fn test_successful_calls_recorded_in_ledger() {
        let app = test_app_with(
            BillingConfig {
                free_usage_limit: 1,
                ..payments_config()
            },
            true,
        );
        let (principal, token) = app.principal().await;

        let response = app.send(get("/payments/subscription", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        // Rejected by quota, so not recorded
        let response = app.send(get("/payments/subscription", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // Anonymous calls are never recorded
        let response = app.send(get("/payments/plans", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let entries = app.store.list_ledger_entries(principal.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LedgerEntryType::ApiCall);
        assert_eq!(entries[0].amount, 0);
        assert!(entries[0].provider_event_id.is_none());
        assert_eq!(entries[0].description, "GET /payments/subscription");
    }

    #[tokio::test]
    async fn test_purchase_history_omits_api_calls() {
        let app = test_app();
        let (_, token) = app.principal().await;

        let response = app.send(get("/payments/my/purchases", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.send(get("/payments/my/purchases", Some(&token))).await;
        let body = body_json(response).await;
        assert_eq!(body["payments"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_paid_tier_is_not_held_to_quota() {
        let app = test_app_with(
            BillingConfig {
                free_usage_limit: 1,
                ..payments_config()
            },
            true,
        );
        let (principal, token) = app.principal().await;
        app.store
            .sync_principal_subscription(
                principal.id,
                &PrincipalSubscriptionSync {
                    tier: Some(SubscriptionTier::Pro),
                    provider_subscription_id: "sub_pro".to_string(),
                    provider_price_id: Some("price_pro".to_string()),
                    status: SubscriptionStatus::Active,
                    current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(20)),
                    cancel_at_period_end: false,
                },
            )
            .await
            .unwrap();

        for expected in 1..=3 {
            let response = app.send(get("/payments/subscription", Some(&token))).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                header_str(&response, "x-usage-count"),
                Some(expected.to_string().as_str())
            );
            assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("100"));
        }
    }

    #[tokio::test]
    async fn test_anonymous_rate_limit_sets_retry_after() {
        let app = test_app_with(
            BillingConfig {
                rate_limits: RateLimitConfig {
                    free: TierLimit::new(2, 3600),
                    ..RateLimitConfig::default()
                },
                ..payments_config()
            },
            true,
        );
        let from = |ip: &str| {
            Request::builder()
                .uri("/payments/plans")
                .header("X-Forwarded-For", ip)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.send(from("203.0.113.9")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-usage-count").is_none());
        }

        let response = app.send(from("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_str(&response, "retry-after"), Some("3600"));
        let body = body_json(response).await;
        assert_eq!(body["retryAfter"], 3600);

        // Another address has its own window
        let response = app.send(from("198.51.100.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_plans_lists_tiers() {
        let app = test_app();
        let response = app.send(get("/payments/plans", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let plans = body.as_array().unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0]["tier"], "free");
        assert_eq!(plans[0]["monthly_quota"], 10);
        assert_eq!(plans[0]["checkout_available"], false);
        assert_eq!(plans[1]["tier"], "pro");
        assert_eq!(plans[1]["checkout_available"], true);
        assert_eq!(plans[2]["checkout_available"], false);
    }

    #[tokio::test]
    async fn test_purchase_premium_offering() {
        let app = test_app();
        let (_, token) = app.principal().await;
        let offering = app.offering(PriceType::Premium, 1999, true).await;

        let response = app
            .send(post(
                &format!("/payments/purchase/{}", offering.id),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["amount"], 1999);
        assert_eq!(body["platform_fee"], 600);
        assert!(body["client_secret"].is_string());
    }

    #[tokio::test]
    async fn test_purchase_preconditions() {
        let app = test_app();
        let (_, token) = app.principal().await;

        let free = app.offering(PriceType::Free, 0, true).await;
        let response = app
            .send(post(&format!("/payments/purchase/{}", free.id), &token, json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let no_payout = app.offering(PriceType::Premium, 500, false).await;
        let response = app
            .send(post(
                &format!("/payments/purchase/{}", no_payout.id),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["code"], "payout_account_required");

        let response = app
            .send(post(
                &format!("/payments/purchase/{}", uuid::Uuid::new_v4()),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .send(post("/payments/purchase/not-a-uuid", &token, json!({})))
            .await;
        assert!(response.status().is_client_error());

        assert_eq!(app.provider.count_of("create_destination_charge"), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_maps_to_502() {
        let app = test_app();
        let (_, token) = app.principal().await;
        let offering = app.offering(PriceType::Premium, 1000, true).await;
        app.provider.fail(
            "create_destination_charge",
            ProviderError::Upstream("card_declined raw detail".to_string()),
        );

        let response = app
            .send(post(
                &format!("/payments/purchase/{}", offering.id),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(!body.to_string().contains("card_declined"));
    }

    #[tokio::test]
    async fn test_payments_disabled_returns_503() {
        let app = test_app_with(BillingConfig::default(), false);
        let (_, token) = app.principal().await;
        let offering = app.offering(PriceType::Premium, 1000, true).await;

        let response = app
            .send(post(
                &format!("/payments/purchase/{}", offering.id),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let payload = br#"{"id":"evt_1"}"#;
        let response = app.send(webhook(payload, Some(sign(payload)))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_connect_setup_returns_onboarding_link() {
        let app = test_app();
        let (principal, token) = app.principal().await;

        let request = json!({
            "return_url": "https://app.example.com/creator/done",
            "refresh_url": "https://app.example.com/creator/retry",
        });
        let response = app
            .send(post("/payments/connect/setup", &token, request.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let first = body_json(response).await;
        assert!(first["onboarding_url"].is_string());

        // Second setup reuses the stored account
        let response = app.send(post("/payments/connect/setup", &token, request)).await;
        let second = body_json(response).await;
        assert_eq!(first["account_id"], second["account_id"]);
        assert_eq!(app.provider.count_of("create_payout_account"), 1);

        let stored = app.store.get_principal(principal.id).await.unwrap().unwrap();
        assert_eq!(
            stored.payout_account_id.as_deref(),
            first["account_id"].as_str()
        );

        let response = app
            .send(post(
                "/payments/connect/setup",
                &token,
                json!({ "return_url": "javascript:alert(1)", "refresh_url": "https://x.test" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_checkout_for_configured_tier() {
        let app = test_app();
        let (_, token) = app.principal().await;

        let response = app
            .send(post(
                "/payments/checkout",
                &token,
                json!({
                    "tier": "pro",
                    "success_url": "https://app.example.com/ok",
                    "cancel_url": "https://app.example.com/cancel",
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["url"].as_str().is_some_and(|u| u.starts_with("https://")));

        let response = app
            .send(post(
                "/payments/checkout",
                &token,
                json!({
                    "tier": "enterprise",
                    "success_url": "https://app.example.com/ok",
                    "cancel_url": "https://app.example.com/cancel",
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_webhook_credits_once_and_skips_admission() {
        let app = test_app_with(
            BillingConfig {
                rate_limits: RateLimitConfig {
                    free: TierLimit::new(1, 3600),
                    ..RateLimitConfig::default()
                },
                ..payments_config()
            },
            true,
        );
        let (buyer, _) = app.principal().await;
        let offering = app.offering(PriceType::Premium, 1000, true).await;

        let payload = serde_json::to_vec(&json!({
            "id": "evt_router_1",
            "type": "payment_intent.succeeded",
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": {
                "id": "pi_router_1",
                "object": "payment_intent",
                "amount": 1000,
                "amount_received": 1000,
                "currency": "usd",
                "metadata": {
                    "principal_id": buyer.id.to_string(),
                    "offering_id": offering.id.to_string(),
                    "creator_id": offering.creator_id.to_string(),
                }
            }}
        }))
        .unwrap();

        let response = app.send(webhook(&payload, Some(sign(&payload)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"], "processed");

        let response = app.send(webhook(&payload, Some(sign(&payload)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"], "duplicate");

        let stored = app.store.get_offering(offering.id).await.unwrap().unwrap();
        assert_eq!(stored.revenue.total_earnings, 700);
        assert_eq!(app.store.list_ledger_entries(buyer.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_signature_rejections() {
        let app = test_app();
        let payload = br#"{"id":"evt_sig","type":"invoice.paid","created":1,"data":{"object":{}}}"#;

        let response = app.send(webhook(payload, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let forged = signature_header(
            payload,
            "whsec_someone_else",
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let response = app.send(webhook(payload, Some(forged))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_shutdown_stops_payment_work() {
        let app = test_app();
        let (_, token) = app.principal().await;
        let offering = app.offering(PriceType::Premium, 1000, true).await;
        app.state.billing.shutdown();

        let response = app
            .send(post(
                &format!("/payments/purchase/{}", offering.id),
                &token,
                json!({}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.send(get("/health", None)).await;
        assert_eq!(body_json(response).await["status"], "shutting_down");
    }
}
