//! Authentication gate behaviour over real connections.

mod common;

use common::*;
use netd_server::base::read_control_line;
use netd_server::{
    handler_fn, BaseProvider, ClientAuth, Config, ConnectionContext, Credential, Message,
    Provider, ProviderError, Responder, Server, ServerError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const WAIT: Duration = Duration::from_secs(3);

fn auth_config(required: bool) -> Config {
    let mut config = local_config();
    config.auth.enabled = true;
    config.auth.required = required;
    config.auth.client_credentials = vec![Credential::new("alice", "secret")];
    config
}

#[tokio::test]
async fn test_matching_credentials_admitted() {
    let server = Server::new(auth_config(true)).unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"alice secret\n").await.unwrap();

    assert!(wait_until(WAIT, || server.clients().len() == 1).await);
    let provider = provider_at(&created, 0);
    assert!(provider.sent().is_empty());
    assert_eq!(provider.close_calls(), 0);

    server.close().await;
}

#[tokio::test]
async fn test_wrong_password_rejected_and_closed() {
    let server = Server::new(auth_config(true)).unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"alice wrong\n").await.unwrap();

    assert!(wait_until(WAIT, || created_len(&created) == 1
        && provider_at(&created, 0).close_calls() == 1)
    .await);
    let provider = provider_at(&created, 0);
    assert_eq!(provider.sent(), vec![b"Error: Authentication failed".to_vec()]);
    assert!(server.clients().is_empty());

    server.close().await;
}

#[tokio::test]
async fn test_mandatory_auth_rejects_anonymous() {
    let server = Server::new(auth_config(true)).unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"anonymous\n").await.unwrap();

    assert!(wait_until(WAIT, || created_len(&created) == 1
        && provider_at(&created, 0).close_calls() == 1)
    .await);
    let sent = provider_at(&created, 0).sent();
    assert_eq!(sent.len(), 1);
    assert!(String::from_utf8_lossy(&sent[0]).contains("Authentication needed"));
    assert!(server.clients().is_empty());

    server.close().await;
}

#[tokio::test]
async fn test_optional_auth_admits_anonymous() {
    let server = Server::new(auth_config(false)).unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"anonymous\n").await.unwrap();
    assert!(wait_until(WAIT, || server.clients().len() == 1).await);

    // Credentials that are present are still checked
    let mut bad = connect(addr).await;
    bad.write_all(b"alice wrong\n").await.unwrap();
    assert!(wait_until(WAIT, || created_len(&created) == 2
        && provider_at(&created, 1).close_calls() == 1)
    .await);
    assert_eq!(server.clients().len(), 1);

    server.close().await;
}

#[tokio::test]
async fn test_static_list_admits_when_authenticator_rejects() {
    let server = Server::builder(auth_config(true))
        .client_authenticator(|_: &dyn ClientAuth| false)
        .build()
        .unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"alice secret\n").await.unwrap();
    assert!(wait_until(WAIT, || server.clients().len() == 1).await);

    server.close().await;
}

#[tokio::test]
async fn test_authenticator_admits_unlisted_peer() {
    let mut config = local_config();
    config.auth.enabled = true;
    config.auth.required = true;

    let server = Server::builder(config)
        .cluster_authenticator(|auth: &dyn ClientAuth| auth.credentials().username == "node-b")
        .build()
        .unwrap();
    let created = created();
    let addr = server
        .serve_clusters(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut good = connect(addr).await;
    good.write_all(b"node-b pw\n").await.unwrap();
    assert!(wait_until(WAIT, || server.clusters().len() == 1).await);

    let mut bad = connect(addr).await;
    bad.write_all(b"node-c pw\n").await.unwrap();
    assert!(wait_until(WAIT, || created_len(&created) == 2
        && provider_at(&created, 1).close_calls() == 1)
    .await);
    assert_eq!(server.clusters().len(), 1);

    server.close().await;
}

#[tokio::test]
async fn test_disabled_auth_admits_everything() {
    let mut config = auth_config(true);
    config.auth.enabled = false;
    let server = Server::new(config).unwrap();
    let created = created();
    let addr = server
        .serve_clients(credential_handler(created.clone()))
        .await
        .unwrap();

    let mut anonymous = connect(addr).await;
    anonymous.write_all(b"anonymous\n").await.unwrap();
    let mut wrong = connect(addr).await;
    wrong.write_all(b"alice wrong\n").await.unwrap();

    assert!(wait_until(WAIT, || server.clients().len() == 2).await);
    server.close().await;
}

#[tokio::test]
async fn test_missing_credential_source_is_fatal() {
    let mut config = local_config();
    config.auth.enabled = true;
    // Authenticators come from the builder, so only serving can tell
    assert!(config.validate().is_ok());
    let server = Server::new(config).unwrap();

    let err = server
        .serve_clients(credential_handler(created()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NoAuthSource(_)));
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_rejection_reaches_the_peer() {
    let server = Server::new(auth_config(true)).unwrap();
    let handler = handler_fn(|mut ctx: ConnectionContext| async move {
        let line = read_control_line(&mut ctx.stream, 256)
            .await?
            .unwrap_or_default();
        let mut parts = line.split_whitespace().skip(1);
        let credentials = match (parts.next(), parts.next()) {
            (Some(user), Some(pass)) => Credential::new(user, pass),
            _ => return Err(ProviderError::Handshake("expected AUTH".into())),
        };
        let provider =
            BaseProvider::with_credentials(ctx, credentials, |_: &Responder, _: Message| {});
        Ok::<_, ProviderError>(provider as Arc<dyn Provider>)
    });
    let addr = server.serve_clients(handler).await.unwrap();

    let mut client = connect(addr).await;
    client.write_all(b"AUTH alice wrong\n").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"Error: Authentication failed");
    assert!(server.clients().is_empty());

    server.close().await;
}
