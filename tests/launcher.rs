//! Refresh, validate, then spawn: nothing starts unless every check passes.

use std::{path::PathBuf, sync::Arc};

use bugdesk::{
    auth::{OAuthClient, ValidationFailure},
    config::{AuthorizationConfig, HttpConfig},
    launcher::Launcher,
    testutils::{
        access_token, init_tracing, sign_claims, test_validator, FakeAuthServer, RecordingSpawner,
        TEST_AUDIENCE, TEST_CLIENT_ID,
    },
    vault::{CredentialVault, MemoryVault},
    Error,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use url::Url;

const ENTRYPOINT: &str = "/opt/bugdesk/bugdesk-server";

fn launcher(oauth: OAuthClient, vault: &MemoryVault, spawner: &RecordingSpawner) -> Launcher {
    Launcher::new(
        oauth,
        test_validator(),
        Arc::new(vault.clone()),
        Arc::new(spawner.clone()),
        PathBuf::from(ENTRYPOINT),
    )
}

fn stored(vault: &MemoryVault) -> Option<String> {
    vault.get().unwrap().map(|s| s.expose().to_string())
}

#[tokio::test]
async fn test_launch_with_valid_credential() {
    init_tracing();
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let code = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(server.token_grants(), vec!["refresh_token"]);
    let launches = spawner.launches();
    assert_eq!(launches.len(), 1);
    let (entrypoint, args) = &launches[0];
    assert_eq!(entrypoint, &PathBuf::from(ENTRYPOINT));
    assert_eq!(args.user_id, "u-42");

    let claims = test_validator().validate(args.access_token.expose()).unwrap();
    assert_eq!(claims.user_id, "u-42");
    assert_eq!(args.to_argv()[0], "u-42");
    assert_eq!(vault.write_count(), 0);
}

#[tokio::test]
async fn test_revoked_credential_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    server.revoke_refresh_tokens();
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CredentialExpired(_)));
    assert!(err.remediation().unwrap().contains("bugdesk-auth login"));
    assert!(!err.to_string().contains("R1"));
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_missing_credential_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    let vault = MemoryVault::new();
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CredentialMissing));
    assert!(server.token_grants().is_empty());
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_wrong_audience_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    server.set_token_audience("urn:mcp:somewhere-else");
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::TokenRejected(ValidationFailure::WrongAudience)
    ));
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_expired_token_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    server.set_access_token(Some(access_token("u-42", TEST_AUDIENCE, -60).unwrap()));
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TokenRejected(ValidationFailure::Expired)));
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_forged_signature_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    let now = chrono::Utc::now().timestamp();
    let forged = encode(
        &Header::default(),
        &json!({"sub": "u-42", "aud": TEST_AUDIENCE, "iat": now, "exp": now + 600}),
        &EncodingKey::from_secret(b"not-the-issuer-key"),
    )
    .unwrap();
    server.set_access_token(Some(forged));
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::TokenRejected(ValidationFailure::SignatureInvalid)
    ));
    assert!(err.is_security_failure());
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_missing_subject_does_not_launch() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    let exp = chrono::Utc::now().timestamp() + 600;
    server.set_access_token(Some(
        sign_claims(&json!({"aud": TEST_AUDIENCE, "exp": exp})).unwrap(),
    ));
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::TokenRejected(ValidationFailure::MissingClaims)
    ));
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_rotated_refresh_token_is_persisted() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.set_rotation(true);
    server.grant_refresh_token("R1");
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();
    let launcher = launcher(server.oauth_client().unwrap(), &vault, &spawner);

    launcher.run().await.unwrap();
    assert_eq!(stored(&vault).as_deref(), Some("R2"));
    assert_eq!(vault.write_count(), 1);
    assert!(!server.is_refresh_token_valid("R1"));

    launcher.run().await.unwrap();
    assert_eq!(stored(&vault).as_deref(), Some("R3"));
    assert_eq!(spawner.launch_count(), 2);
}

#[tokio::test]
async fn test_unreachable_authorization_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let config = AuthorizationConfig {
        server_url: Url::parse(&format!("http://{addr}/")).unwrap(),
        client_id: TEST_CLIENT_ID.to_string(),
        resource: TEST_AUDIENCE.to_string(),
        scopes: Vec::new(),
    };
    let oauth = OAuthClient::new(&config, &HttpConfig::default()).unwrap();
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new();

    let err = launcher(oauth, &vault, &spawner).run().await.unwrap_err();

    assert!(matches!(err, Error::UpstreamUnavailable(_)));
    assert_eq!(stored(&vault).as_deref(), Some("R1"));
    assert_eq!(spawner.launch_count(), 0);
}

#[tokio::test]
async fn test_server_exit_code_is_returned() {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    server.grant_refresh_token("R1");
    let vault = MemoryVault::with_secret("R1");
    let spawner = RecordingSpawner::new().with_exit_code(7);

    let code = launcher(server.oauth_client().unwrap(), &vault, &spawner)
        .run()
        .await
        .unwrap();
    assert_eq!(code, 7);
}
