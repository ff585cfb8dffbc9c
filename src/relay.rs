//! Line-oriented relay protocol served by the `netd` daemon.
//!
//! When authentication is enabled a connection may open with
//! `AUTH <user> <pass>`; every other line is one command.

use bytes::Bytes;
use netd_server::base::read_control_line;
use netd_server::{
    handler_fn, BaseInfo, BaseProvider, Broadcast, ConnectionContext, Credential, Handler,
    LineParser, Message, Provider, ProviderError, Responder,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Pong,
    Pub(Bytes),
    Cluster(Bytes),
    Info,
    Who,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(message: &Message) -> Self {
        let name = String::from_utf8_lossy(&message.command).to_ascii_uppercase();
        match name.as_str() {
            "PING" => Command::Ping,
            "PONG" => Command::Pong,
            "PUB" => Command::Pub(message.data.clone()),
            "CLUSTER" => Command::Cluster(message.data.clone()),
            "INFO" => Command::Info,
            "WHO" => Command::Who,
            "QUIT" => Command::Quit,
            _ => Command::Unknown(name),
        }
    }
}

/// Parses an `AUTH <user> <pass>` line.
pub fn parse_auth(line: &str) -> Option<Credential> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("AUTH") {
        return None;
    }
    let username = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Credential::new(username, password))
}

fn with_newline(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.extend_from_slice(data);
    out.push(b'\n');
    out
}

fn dispatch(server_info: &BaseInfo, responder: &Responder, message: Message) {
    let peer = responder.peer().socket_addr();
    let reply = |payload: Vec<u8>| {
        if let Err(e) = responder.reply(payload) {
            tracing::debug!("[{}] Reply failed: {}", peer, e);
        }
    };

    match Command::parse(&message) {
        Command::Ping => reply(b"PONG\n".to_vec()),
        Command::Pong => {}
        Command::Pub(data) => match responder.connections().send_to_clients(&with_newline(&data)) {
            Ok(()) => reply(b"+OK\n".to_vec()),
            Err(e) => reply(format!("Error: {}\n", e).into_bytes()),
        },
        Command::Cluster(data) => {
            match responder.connections().send_to_clusters(&with_newline(&data)) {
                Ok(()) => reply(b"+OK\n".to_vec()),
                Err(e) => reply(format!("Error: {}\n", e).into_bytes()),
            }
        }
        Command::Info => reply(with_newline(server_info.to_json().as_bytes())),
        Command::Who => {
            let clients = responder.connections().clients();
            match serde_json::to_vec(&clients) {
                Ok(json) => reply(with_newline(&json)),
                Err(e) => reply(format!("Error: {}\n", e).into_bytes()),
            }
        }
        Command::Quit => responder.close(),
        Command::Unknown(name) => {
            tracing::debug!("[{}] Unknown command {}", peer, name);
            reply(format!("Error: unknown command '{}'\n", name).into_bytes());
        }
    }
}

/// Pings the peer every `interval` until the provider closes.
fn spawn_pinger(provider: Arc<BaseProvider>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let closed = provider.close_notify();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if provider.send_message(b"PING\n").is_err() {
                        break;
                    }
                }
                _ = closed.clone().closed() => break,
            }
        }
    });
}

/// What the connection opened with while authentication is enabled.
enum Opening {
    /// A well-formed `AUTH` line.
    Auth(Credential),
    /// A command line sent without authenticating first.
    Command(String),
    /// Nothing arrived before the auth deadline.
    Silent,
}

async fn read_opening(ctx: &mut ConnectionContext) -> Result<Opening, ProviderError> {
    let deadline = ctx.config.limits.auth_timeout();
    let limit = netd_server::MAX_CONTROL_LINE_SIZE;
    let line = match tokio::time::timeout(deadline, read_control_line(&mut ctx.stream, limit)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Err(ProviderError::Closed),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Ok(Opening::Silent),
    };

    let is_auth = line
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("AUTH"));
    if !is_auth {
        return Ok(Opening::Command(line));
    }
    parse_auth(&line)
        .map(Opening::Auth)
        .ok_or_else(|| ProviderError::Handshake("expected AUTH <user> <pass>".to_string()))
}

/// Handler used for both listeners.
///
/// A connection that skips `AUTH` is anonymous: with optional auth its
/// first line is dispatched like any other command, with required auth
/// the gate turns it away with an explanatory error.
pub fn handler() -> Handler {
    handler_fn(|mut ctx: ConnectionContext| async move {
        let opening = if ctx.config.auth.enabled {
            read_opening(&mut ctx).await?
        } else {
            Opening::Silent
        };

        let server_info = ctx.server_info.clone();
        let ping_interval = ctx.config.limits.ping_interval();
        let on_message = move |responder: &Responder, message: Message| {
            dispatch(&server_info, responder, message)
        };

        let provider = match opening {
            Opening::Auth(credentials) => {
                BaseProvider::with_credentials(ctx, credentials, on_message)
            }
            // Required auth turns the provider away before it may answer
            Opening::Command(_) if ctx.config.auth.required => BaseProvider::new(ctx, on_message),
            Opening::Command(line) => {
                let mut parser = LineParser::new(ctx.config.limits.max_payload);
                parser.prefill(line.as_bytes());
                parser.prefill(b"\n");
                BaseProvider::with_parser(ctx, None, parser, on_message)
            }
            Opening::Silent => BaseProvider::new(ctx, on_message),
        };
        spawn_pinger(provider.clone(), ping_interval);

        Ok::<_, ProviderError>(provider as Arc<dyn Provider>)
    })
}
