use crate::{
    utils::app_error::{AppError, InputError},
    Environment,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde_json::Value;

/// Keys accepted for the token, in lookup order.
const TOKEN_KEYS: [&str; 2] = ["token", "Token"];

pub async fn run(State(env): State<Environment>, body: Bytes) -> Result<Response, AppError> {
    let token = extract_token(&body)?;

    let verdict = env.verifier.verify(&token).await?;
    if !verdict.success {
        return Err(AppError::Rejected(verdict.error_codes()));
    }
    log::info!("Token verified");

    let location = &env.document;
    let not_found = || AppError::NotFound {
        container: location.container.clone(),
        blob: location.blob.clone(),
    };
    if !env.store.exists(location).await? {
        return Err(not_found());
    }

    let stream = env.store.open(location).await?.ok_or_else(not_found)?;
    log::info!("Streaming {}/{}", location.container, location.blob);

    // headers are gone by the time a later chunk fails, so all we can do is log and cut the body
    let stream = stream.inspect_err(|err| {
        tracing::error!("Blob stream failed: {}", err);
    });

    Ok((
        [
            (CONTENT_TYPE, "application/pdf"),
            (CONTENT_DISPOSITION, "inline"),
            (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Pulls the captcha token out of a JSON request body.
///
/// `token` is tried before `Token`. A token of only whitespace counts as
/// missing, since no captcha widget issues one.
pub fn extract_token(body: &[u8]) -> Result<String, InputError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(InputError::EmptyBody);
    }

    let json: Value = serde_json::from_slice(body).map_err(InputError::InvalidJson)?;

    TOKEN_KEYS
        .iter()
        .filter_map(|key| json.get(key).and_then(Value::as_str))
        .find(|token| !token.trim().is_empty())
        .map(str::to_owned)
        .ok_or(InputError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app,
        storage::{memory::MemoryStore, DocumentLocation, DocumentStore},
        turnstile::{TokenVerifier, VerificationResult},
        EnvironmentInner,
    };
    use async_trait::async_trait;
    use axum::{
        body::to_bytes,
        http::{Method, Request, StatusCode},
        Router,
    };
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;
    use tracing::Level;

    /// Replays a canned verdict and remembers every token it saw.
    struct StubVerifier {
        reply: fn() -> Result<VerificationResult, AppError>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TokenVerifier for StubVerifier {
        async fn verify(&self, token: &str) -> Result<VerificationResult, AppError> {
            self.seen.lock().unwrap().push(token.to_string());
            (self.reply)()
        }
    }

    fn accepted() -> Result<VerificationResult, AppError> {
        Ok(VerificationResult { success: true, ..Default::default() })
    }

    fn rejected() -> Result<VerificationResult, AppError> {
        Ok(VerificationResult {
            success: false,
            error_codes: Some(vec!["invalid-input-response".into()]),
            ..Default::default()
        })
    }

    fn location() -> DocumentLocation {
        DocumentLocation { container: "cv".into(), blob: "cv.pdf".into() }
    }

    fn pdf_store() -> MemoryStore {
        MemoryStore::default().with_blob(&location(), &[b"%PDF-1.7\n", b"%%EOF"])
    }

    fn test_app(
        reply: fn() -> Result<VerificationResult, AppError>,
        store: impl DocumentStore + 'static,
    ) -> (Router, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let env = Arc::new(EnvironmentInner {
            verifier: Box::new(StubVerifier { reply, seen: Arc::clone(&seen) }),
            store: Box::new(store),
            document: location(),
        });
        (app(env, Level::INFO), seen)
    }

    fn post_cv(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/cv")
            .header(CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_of(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_verified_token_streams_pdf() {
        let (app, seen) = test_app(accepted, pdf_store());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(response.headers()[CONTENT_DISPOSITION], "inline");
        assert!(response.headers()[CACHE_CONTROL].to_str().unwrap().contains("no-cache"));
        assert_eq!(&body_of(response).await[..], b"%PDF-1.7\n%%EOF");
        assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn test_capitalised_key_behaves_the_same() {
        let (app, seen) = test_app(accepted, pdf_store());

        let response = app.oneshot(post_cv(r#"{"Token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(&body_of(response).await[..], b"%PDF-1.7\n%%EOF");
        assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_bodies_are_rejected_before_verification() {
        let bodies = [
            "",
            "   \n",
            "not json",
            "{\"token\":",
            "{}",
            "[]",
            "\"abc\"",
            r#"{"token":""}"#,
            r#"{"token":"   "}"#,
            r#"{"token":123}"#,
            r#"{"token":null}"#,
            r#"{"TOKEN":"abc"}"#,
            r#"{"data":{"token":"abc"}}"#,
        ];

        for body in bodies {
            let (app, seen) = test_app(accepted, pdf_store());
            let response = app.oneshot(post_cv(body)).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body:?}");
            assert!(seen.lock().unwrap().is_empty(), "body: {body:?}");
        }
    }

    #[tokio::test]
    async fn test_rejected_token_is_forbidden() {
        let (app, _) = test_app(rejected, pdf_store());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(&body_of(response).await[..], b"Verification failed.");
    }

    #[tokio::test]
    async fn test_upstream_failures_are_bad_gateway() {
        fn unavailable() -> Result<VerificationResult, AppError> {
            Err(AppError::UpstreamUnavailable("status 503 Service Unavailable".into()))
        }
        fn malformed() -> Result<VerificationResult, AppError> {
            Err(AppError::UpstreamMalformed(
                serde_json::from_str::<Value>("<html>").unwrap_err(),
            ))
        }

        for reply in [unavailable as fn() -> _, malformed] {
            let (app, _) = test_app(reply, pdf_store());
            let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn test_missing_secret_is_server_error() {
        fn misconfigured() -> Result<VerificationResult, AppError> {
            Err(AppError::Misconfigured("TURNSTILE_SECRET_KEY"))
        }
        let (app, _) = test_app(misconfigured, pdf_store());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert!(!String::from_utf8_lossy(&body).contains("TURNSTILE"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let (app, _) = test_app(accepted, MemoryStore::default());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_download_is_server_error() {
        let (app, _) = test_app(accepted, pdf_store().broken_download());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(&body_of(response).await[..], b"Something went wrong.");
    }

    #[tokio::test]
    async fn test_blob_deleted_after_existence_check_is_not_found() {
        /// Says the blob exists, then finds nothing to download.
        struct VanishingStore;

        #[async_trait]
        impl DocumentStore for VanishingStore {
            async fn exists(&self, _location: &DocumentLocation) -> azure_core::Result<bool> {
                Ok(true)
            }

            async fn open(
                &self,
                _location: &DocumentLocation,
            ) -> azure_core::Result<Option<crate::storage::DocumentStream>> {
                Ok(None)
            }
        }

        let (app, _) = test_app(accepted, VanishingStore);

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_storage_failure_is_server_error() {
        let (app, _) = test_app(accepted, MemoryStore::unreachable());

        let response = app.oneshot(post_cv(r#"{"token":"abc"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&body_of(response).await[..], b"Something went wrong.");
    }

    #[tokio::test]
    async fn test_get_is_not_allowed() {
        let (app, seen) = test_app(accepted, pdf_store());

        let request = Request::builder().uri("/cv").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_extract_token_prefers_lowercase_key() {
        let token = extract_token(br#"{"token":"first","Token":"second"}"#).unwrap();
        assert_eq!(token, "first");

        let token = extract_token(br#"{"token":"","Token":"second"}"#).unwrap();
        assert_eq!(token, "second");
    }

    #[test]
    fn test_extract_token_errors() {
        assert!(matches!(extract_token(b""), Err(InputError::EmptyBody)));
        assert!(matches!(extract_token(b"{oops"), Err(InputError::InvalidJson(_))));
        assert!(matches!(extract_token(b"{\"token\":false}"), Err(InputError::MissingToken)));
    }
}
