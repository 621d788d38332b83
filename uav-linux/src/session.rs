//! Async drivers: move messages between the core state machines and a connection.
//!
//! Initiator drivers open a run; `serve_connection` answers one run and picks the protocol
//! from the shape of the first message.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uav_core::delegation::{self, BaseStation, IntroNonceIssued, IntroSent};
use uav_core::enrollment::{self, EnrollInitiator};
use uav_core::{field, AuthMode, AuthOutcome, ChallengeIssued, Message, Node, NonceSent, ProtocolError};

use crate::state;
use crate::transport::{FramedConnection, TransportError};

/// A run did not complete.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unrecognised request (fields: {0})")]
    UnknownRequest(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub timeout: Duration,
    /// Mode used when serving authentication requests.
    pub mode: AuthMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            mode: AuthMode::Plain,
        }
    }
}

/// Which protocol a connection opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Enrollment,
    Authentication,
    PreEnrollment,
    CredentialRequest,
    Introduction,
}

impl Request {
    pub fn classify(msg: &Message) -> Option<Self> {
        if msg.has(field::C) {
            Some(Request::Enrollment)
        } else if msg.has(field::M0) {
            Some(Request::Authentication)
        } else if msg.has(field::DATA) {
            Some(Request::PreEnrollment)
        } else if msg.has(field::ID_UAV) {
            Some(Request::CredentialRequest)
        } else if msg.has(field::ID) && msg.field_names().all(|f| f == field::ID) {
            Some(Request::Introduction)
        } else {
            None
        }
    }
}

/// What a served connection accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    Enrolled(String),
    Authenticated(AuthOutcome),
    PreEnrolled(String),
    Introduced(AuthOutcome),
}

impl std::fmt::Display for Served {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Served::Enrolled(peer) => write!(f, "enrolled {peer}"),
            Served::Authenticated(o) if o.session_key.is_some() => {
                write!(f, "authenticated {} (session key)", o.peer)
            }
            Served::Authenticated(o) => write!(f, "authenticated {}", o.peer),
            Served::PreEnrolled(bs) => write!(f, "pre-enrolled by {bs}"),
            Served::Introduced(o) => write!(f, "introduced {}", o.peer),
        }
    }
}

/// Mutual enrollment with `peer`: our pass first, then answer theirs.
pub async fn enroll<S: AsyncRead + AsyncWrite + Unpin>(
    node: &mut Node,
    conn: &mut FramedConnection<S>,
    peer: &str,
    opts: SessionOptions,
) -> Result<(), SessionError> {
    let (pending, challenge) = EnrollInitiator::start(node, peer);
    conn.send(&challenge).await?;
    let reply = conn.receive(opts.timeout).await?;
    pending.finish(node, &reply)?;

    let request = conn.receive(opts.timeout).await?;
    request.expect_from(peer)?;
    let (_, answer) = enrollment::respond(node, &request)?;
    conn.send(&answer).await?;
    info!(node = node.id(), peer, "mutual enrollment complete");
    Ok(())
}

/// Authenticate `peer` (and establish a key in `SessionKey` mode).
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    node: &mut Node,
    conn: &mut FramedConnection<S>,
    peer: &str,
    mode: AuthMode,
    opts: SessionOptions,
) -> Result<AuthOutcome, SessionError> {
    let (state, m0) = NonceSent::start(node, peer, mode)?;
    conn.send(&m0).await?;
    let m1 = conn.receive(opts.timeout).await?;
    let (state, m2) = state.on_challenge(node, &m1)?;
    // From here on the responder may have committed, so any failure rotates.
    if let Err(e) = conn.send(&m2).await {
        return Err(state.on_ack_lost(node, &e.to_string()).into());
    }
    match conn.receive(opts.timeout).await {
        Ok(m3) => Ok(state.on_ack(node, &m3)?),
        Err(e) => Err(state.on_ack_lost(node, &e.to_string()).into()),
    }
}

/// Base Station side of pre-enrollment against `target`. Returns the number of pairs stored.
pub async fn pre_enroll<S: AsyncRead + AsyncWrite + Unpin>(
    bs: &mut BaseStation,
    conn: &mut FramedConnection<S>,
    target: &str,
    opts: SessionOptions,
) -> Result<usize, SessionError> {
    let (pending, request) = bs.begin_pre_enrollment(target);
    conn.send(&request).await?;
    let reply = conn.receive(opts.timeout).await?;
    Ok(pending.on_responses(bs, &reply)?)
}

/// Ask the Base Station for a credential for `target` and store it concealed.
pub async fn fetch_credential<S: AsyncRead + AsyncWrite + Unpin>(
    node: &mut Node,
    conn: &mut FramedConnection<S>,
    target: &str,
    opts: SessionOptions,
) -> Result<(), SessionError> {
    conn.send(&delegation::request_credential(node, target)).await?;
    let handoff = conn.receive(opts.timeout).await?;
    let got = delegation::accept_credential(node, &handoff)?;
    if got != target {
        warn!(node = node.id(), asked = target, got = %got, "base station answered for another node");
    }
    Ok(())
}

/// Introduce this node to `target` with a previously fetched credential.
pub async fn introduce<S: AsyncRead + AsyncWrite + Unpin>(
    node: &mut Node,
    conn: &mut FramedConnection<S>,
    target: &str,
    opts: SessionOptions,
) -> Result<AuthOutcome, SessionError> {
    let (state, hello) = IntroSent::start(node, target)?;
    conn.send(&hello).await?;
    let nonce = conn.receive(opts.timeout).await?;
    let (state, proof) = state.on_nonce(node, &nonce)?;
    conn.send(&proof).await?;
    let confirmation = conn.receive(opts.timeout).await?;
    let (outcome, ack) = state.on_confirmation(node, &confirmation)?;
    conn.send(&ack).await?;
    Ok(outcome)
}

/// Answer one run on an accepted connection. The node stays locked from the first
/// message until the run ends.
///
/// With a state file, the peer table is reloaded before the run (other processes may have
/// rotated credentials) and only the records the run changed are written back.
pub async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
    node: &Mutex<Node>,
    conn: &mut FramedConnection<S>,
    opts: SessionOptions,
    state_path: Option<&Path>,
) -> Result<Served, SessionError> {
    let first = conn.receive(opts.timeout).await?;
    let mut node = node.lock().await;
    if let Some(path) = state_path {
        match state::load(path) {
            Ok(peers) => *node.peers_mut() = peers,
            Err(e) => warn!(error = %e, "peer table not reloaded, using the in-memory copy"),
        }
    }
    let before = node.peers().clone();
    let res = respond(&mut node, conn, &first, opts).await;
    if let Err(SessionError::Protocol(e)) = &res {
        reject(conn, node.id(), &e.to_string()).await;
    }
    if let Some(path) = state_path {
        if let Err(e) = state::save_changes(path, &before, node.peers()) {
            warn!(error = %e, "peer table not saved");
        }
    }
    res
}

async fn respond<S: AsyncRead + AsyncWrite + Unpin>(
    node: &mut Node,
    conn: &mut FramedConnection<S>,
    first: &Message,
    opts: SessionOptions,
) -> Result<Served, SessionError> {
    first.check_error()?;
    let request = Request::classify(first).ok_or_else(|| unknown(first))?;
    debug!(node = node.id(), ?request, "request received");
    match request {
        Request::Enrollment => {
            let (peer, reply) = enrollment::respond(node, first)?;
            conn.send(&reply).await?;
            let (pending, challenge) = EnrollInitiator::start(node, &peer);
            conn.send(&challenge).await?;
            let answer = conn.receive(opts.timeout).await?;
            pending.finish(node, &answer)?;
            Ok(Served::Enrolled(peer))
        }
        Request::Authentication => {
            let (state, m1) = ChallengeIssued::accept(node, first, opts.mode)?;
            conn.send(&m1).await?;
            let m2 = conn.receive(opts.timeout).await?;
            let (outcome, m3) = state.on_confirmation(node, &m2)?;
            // Committed already; a lost ack is the initiator's to recover from.
            conn.send(&m3).await?;
            Ok(Served::Authenticated(outcome))
        }
        Request::PreEnrollment => {
            let reply = delegation::respond_pre_enrollment(node, first)?;
            conn.send(&reply).await?;
            Ok(Served::PreEnrolled(first.id()?.to_string()))
        }
        Request::Introduction => {
            let (state, nonce) = IntroNonceIssued::accept(node, first)?;
            conn.send(&nonce).await?;
            let proof = conn.receive(opts.timeout).await?;
            let (state, confirmation) = state.on_proof(node, &proof)?;
            conn.send(&confirmation).await?;
            match conn.receive(opts.timeout).await {
                Ok(ack) => Ok(Served::Introduced(state.on_ack(node, &ack)?)),
                Err(e) => Err(state.on_ack_lost(node, &e.to_string()).into()),
            }
        }
        Request::CredentialRequest => Err(unknown(first)),
    }
}

/// Base Station: answer one credential request.
pub async fn serve_credential_request<S: AsyncRead + AsyncWrite + Unpin>(
    bs: &Mutex<BaseStation>,
    conn: &mut FramedConnection<S>,
    opts: SessionOptions,
) -> Result<String, SessionError> {
    let first = conn.receive(opts.timeout).await?;
    let mut bs = bs.lock().await;
    if Request::classify(&first) != Some(Request::CredentialRequest) {
        let err = unknown(&first);
        reject(conn, bs.id(), &err.to_string()).await;
        return Err(err);
    }
    match bs.answer_request(&first) {
        Ok(handoff) => {
            conn.send(&handoff).await?;
            Ok(first.id()?.to_string())
        }
        Err(e) => {
            reject(conn, bs.id(), &e.to_string()).await;
            Err(e.into())
        }
    }
}

fn unknown(msg: &Message) -> SessionError {
    SessionError::UnknownRequest(msg.field_names().collect::<Vec<_>>().join(","))
}

/// Best effort: tell the peer why the run ended.
async fn reject<S: AsyncRead + AsyncWrite + Unpin>(conn: &mut FramedConnection<S>, id: &str, reason: &str) {
    if let Err(e) = conn.send(&Message::error(id, reason)).await {
        debug!(error = %e, "could not deliver error reply");
    }
}
