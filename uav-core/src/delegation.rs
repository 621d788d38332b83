//! Base-Station-mediated introduction.
//!
//! 1. Pre-enrollment: the Base Station (BS) harvests a batch of challenge/response pairs
//!    from target A: `{id, data: [C_i = F_BS(x_i)]}` -> `{id, data: [R_i = F_A(C_i)]}`.
//! 2. Handoff: introducer C asks for credentials for A and receives one unused pair
//!    `{id, idUAV, CA, RA}`. C stores `RA` only concealed behind its own device function.
//! 3. Supplementary authentication, first direct contact between C and A:
//!    `{id}` -> `{id, NA}` -> `{id, CA, M1, hash1}` -> `{id, M2, hash2}` -> `{id, hash3}`.
//!    `hash1` binds C's identifier. Afterwards A holds `c = NC` for C, and C holds
//!    `x = gammaC, r = RAp` for A, so A can run ordinary authentication with C.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::auth::AuthOutcome;
use crate::crypto::{self, proofs_match, Block, Transcript};
use crate::node::Node;
use crate::protocol::{field, Message, ProtocolError, Stage};
use crate::puf::DeviceFunction;
use crate::store::PeerRecord;

/// Number of challenge/response pairs harvested per pre-enrollment.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// One harvested credential for a target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialTriple {
    pub x: Block,
    pub c: Block,
    pub r: Block,
    issued: bool,
}

impl CredentialTriple {
    pub fn issued(&self) -> bool {
        self.issued
    }
}

/// Trusted broker holding harvested credentials, handed out at most once each.
#[derive(Debug)]
pub struct BaseStation {
    id: String,
    puf: DeviceFunction,
    batch_size: usize,
    batches: HashMap<String, Vec<CredentialTriple>>,
}

impl BaseStation {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_function(id, DeviceFunction::generate())
    }

    pub fn with_function(id: impl Into<String>, puf: DeviceFunction) -> Self {
        Self {
            id: id.into(),
            puf,
            batch_size: DEFAULT_BATCH_SIZE,
            batches: HashMap::new(),
        }
    }

    /// Pairs harvested per pre-enrollment. Zero is raised to one.
    pub fn with_batch_size(mut self, n: usize) -> Self {
        if n == 0 {
            warn!(bs = %self.id, "batch size 0 requested, harvesting 1 pair per pre-enrollment");
        }
        self.batch_size = n.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generate `batch_size` seeds and the challenge list for `target`.
    pub fn begin_pre_enrollment(&self, target: &str) -> (PreEnrollment, Message) {
        let seeds: Vec<Block> = (0..self.batch_size).map(|_| crypto::random_block()).collect();
        let challenges: Vec<Block> = seeds.iter().map(|x| self.puf.process(x)).collect();
        debug!(bs = %self.id, target, n = seeds.len(), "pre-enrollment challenges issued");
        let msg = Message::new(&self.id).with_list(field::DATA, &challenges);
        (
            PreEnrollment {
                target: target.to_string(),
                seeds,
                challenges,
            },
            msg,
        )
    }

    /// Unissued credentials left for `target`.
    pub fn remaining(&self, target: &str) -> usize {
        self.batches
            .get(target)
            .map(|b| b.iter().filter(|t| !t.issued).count())
            .unwrap_or(0)
    }

    pub fn credentials(&self, target: &str) -> &[CredentialTriple] {
        self.batches.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hand out the next unused credential for `target`: `{id, idUAV, CA, RA}`.
    pub fn issue_credential(&mut self, target: &str) -> Result<Message, ProtocolError> {
        let batch = self
            .batches
            .get_mut(target)
            .ok_or_else(|| ProtocolError::PeerUnknown(target.to_string()))?;
        let triple = batch
            .iter_mut()
            .find(|t| !t.issued)
            .ok_or_else(|| ProtocolError::CredentialsExhausted(target.to_string()))?;
        triple.issued = true;
        let msg = Message::new(&self.id)
            .with_text(field::ID_UAV, target)
            .with_block(field::CA, &triple.c)
            .with_block(field::RA, &triple.r);
        info!(bs = %self.id, target, remaining = self.remaining(target), "credential issued");
        Ok(msg)
    }

    /// Serve a credential request `{id, idUAV}`.
    pub fn answer_request(&mut self, request: &Message) -> Result<Message, ProtocolError> {
        request.check_error()?;
        let requester = request.id()?.to_string();
        let target = request.text(field::ID_UAV)?.to_string();
        debug!(bs = %self.id, requester = %requester, target = %target, "credential requested");
        self.issue_credential(&target)
    }
}

/// Base Station side of pre-enrollment, waiting for the target's responses.
#[derive(Debug)]
pub struct PreEnrollment {
    target: String,
    seeds: Vec<Block>,
    challenges: Vec<Block>,
}

impl PreEnrollment {
    /// Store the `(x, C, R)` triples. Returns how many were added.
    pub fn on_responses(self, bs: &mut BaseStation, msg: &Message) -> Result<usize, ProtocolError> {
        msg.expect_from(&self.target)?;
        let responses = msg.list(field::DATA)?;
        if responses.len() != self.challenges.len() {
            return Err(ProtocolError::MalformedMessage { field: field::DATA });
        }
        let added = responses.len();
        let batch = bs.batches.entry(self.target.clone()).or_default();
        batch.extend(
            self.seeds
                .into_iter()
                .zip(self.challenges)
                .zip(responses)
                .map(|((x, c), r)| CredentialTriple {
                    x,
                    c,
                    r,
                    issued: false,
                }),
        );
        info!(bs = %bs.id, target = %self.target, added, "pre-enrollment complete");
        Ok(added)
    }
}

/// Target side of pre-enrollment: answer every challenge. No local state changes.
pub fn respond_pre_enrollment(node: &Node, request: &Message) -> Result<Message, ProtocolError> {
    request.check_error()?;
    let bs = request.id()?;
    let challenges = request.list(field::DATA)?;
    let responses: Vec<Block> = challenges.iter().map(|c| node.puf(c)).collect();
    debug!(node = node.id(), bs, n = responses.len(), "pre-enrollment answered");
    Ok(Message::new(node.id()).with_list(field::DATA, &responses))
}

/// Introducer's request to the Base Station for credentials of `target`.
pub fn request_credential(node: &Node, target: &str) -> Message {
    Message::new(node.id()).with_text(field::ID_UAV, target)
}

/// Introducer side of the handoff: store `c = CA` and `RA` concealed. Returns the target id.
pub fn accept_credential(node: &mut Node, handoff: &Message) -> Result<String, ProtocolError> {
    handoff.check_error()?;
    handoff.id()?;
    let target = handoff.text(field::ID_UAV)?.to_string();
    let ca = handoff.block(field::CA)?;
    let ra = handoff.block(field::RA)?;
    if node.peers().contains(&target) {
        warn!(node = node.id(), target = %target, "credential for an already known peer rejected");
        return Err(ProtocolError::DuplicatePeer(target));
    }
    let concealed = node.conceal(&ra);
    node.peers_mut().insert(
        &target,
        PeerRecord {
            c: Some(ca),
            fallback: Some(concealed),
            ..PeerRecord::default()
        },
    );
    info!(node = node.id(), target = %target, "credential stored concealed");
    Ok(target)
}

fn intro_hash1(id: &str, ca: &Block, nc: &Block, ra: &Block, na: &Block) -> Block {
    Transcript::new()
        .text(id)
        .block(ca)
        .block(nc)
        .block(ra)
        .block(na)
        .finalize()
}

fn intro_hash2(nc: &Block, ra: &Block, rap: &Block, na: &Block) -> Block {
    Transcript::new()
        .block(nc)
        .block(ra)
        .block(rap)
        .block(na)
        .finalize()
}

fn intro_hash3(rap: &Block, nc: &Block, na: &Block) -> Block {
    Transcript::new().block(rap).block(nc).block(na).finalize()
}

/// Introducer C, introduction `{id}` sent, waiting for A's nonce.
#[derive(Debug)]
pub struct IntroSent {
    target: String,
    ca: Block,
}

impl IntroSent {
    /// Requires a broker-issued credential for `target` (stored `c` and concealed response).
    pub fn start(node: &Node, target: &str) -> Result<(Self, Message), ProtocolError> {
        let record = node.peers().record(target)?;
        let ca = record.c.ok_or_else(|| ProtocolError::NotEnrolled {
            peer: target.to_string(),
            field: "c",
        })?;
        if record.fallback.is_none() {
            return Err(ProtocolError::NoFallbackAvailable);
        }
        debug!(node = node.id(), target, "introduction sent");
        Ok((
            Self {
                target: target.to_string(),
                ca,
            },
            Message::new(node.id()),
        ))
    }

    /// Reveal `RA`, pick the next challenge for A and prove knowledge of the credential.
    pub fn on_nonce(self, node: &Node, msg: &Message) -> Result<(ProofSent, Message), ProtocolError> {
        msg.expect_from(&self.target)?;
        let na = msg.block(field::NA)?;
        let concealed = node
            .peers()
            .record(&self.target)?
            .fallback
            .ok_or(ProtocolError::NoFallbackAvailable)?;
        let ra = node.reveal(&concealed);
        let gamma = crypto::random_block();
        let nc = node.puf(&gamma);
        let reply = Message::new(node.id())
            .with_block(field::CA, &self.ca)
            .with_block(field::M1, &crypto::xor(&ra, &nc))
            .with_block(field::HASH1, &intro_hash1(node.id(), &self.ca, &nc, &ra, &na));
        Ok((
            ProofSent {
                target: self.target,
                na,
                nc,
                gamma,
                ra,
            },
            reply,
        ))
    }
}

/// Introducer C, proof sent, waiting for A's confirmation.
#[derive(Debug)]
pub struct ProofSent {
    target: String,
    na: Block,
    nc: Block,
    gamma: Block,
    ra: Block,
}

impl ProofSent {
    /// Verify A, commit `x = gammaC, r = RAp`, drop the concealed credential, and ack.
    pub fn on_confirmation(
        self,
        node: &mut Node,
        msg: &Message,
    ) -> Result<(AuthOutcome, Message), ProtocolError> {
        msg.expect_from(&self.target)?;
        let m2 = msg.block(field::M2)?;
        let received = msg.block(field::HASH2)?;
        let rap = crypto::xor(&m2, &self.nc);
        if !proofs_match(&received, &intro_hash2(&self.nc, &self.ra, &rap, &self.na)) {
            warn!(node = node.id(), target = %self.target, "supplementary hash2 mismatch");
            return Err(ProtocolError::HashMismatch {
                stage: Stage::Hash2,
            });
        }
        let gamma = self.gamma;
        node.peers_mut().update(&self.target, |rec| {
            rec.x = Some(gamma);
            rec.r = Some(rap);
            rec.fallback = None;
        })?;
        info!(node = node.id(), target = %self.target, "introduced, direct credentials stored");
        let ack = Message::new(node.id())
            .with_block(field::HASH3, &intro_hash3(&rap, &self.nc, &self.na));
        Ok((
            AuthOutcome {
                peer: self.target,
                session_key: None,
                recovered: false,
            },
            ack,
        ))
    }
}

/// Target A, nonce sent to a newly introduced node.
#[derive(Debug)]
pub struct IntroNonceIssued {
    peer: String,
    na: Block,
}

impl IntroNonceIssued {
    /// Accept an introduction `{id}` from a node this one has never stored.
    pub fn accept(node: &Node, msg: &Message) -> Result<(Self, Message), ProtocolError> {
        msg.check_error()?;
        let peer = msg.id()?;
        if node.peers().contains(peer) {
            warn!(node = node.id(), peer, "duplicate introduction rejected");
            return Err(ProtocolError::DuplicatePeer(peer.to_string()));
        }
        let na = crypto::random_block();
        debug!(node = node.id(), peer, "supplementary authentication started");
        Ok((
            Self {
                peer: peer.to_string(),
                na,
            },
            Message::new(node.id()).with_block(field::NA, &na),
        ))
    }

    /// Check C's proof over its identifier and the broker-issued challenge. No fallback.
    pub fn on_proof(self, node: &Node, msg: &Message) -> Result<(IntroAwaitingAck, Message), ProtocolError> {
        msg.expect_from(&self.peer)?;
        let ca = msg.block(field::CA)?;
        let m1 = msg.block(field::M1)?;
        let received = msg.block(field::HASH1)?;
        let ra = node.puf(&ca);
        let nc = crypto::xor(&m1, &ra);
        if !proofs_match(&received, &intro_hash1(&self.peer, &ca, &nc, &ra, &self.na)) {
            warn!(node = node.id(), peer = %self.peer, "supplementary hash1 mismatch");
            return Err(ProtocolError::HashMismatch {
                stage: Stage::Hash1,
            });
        }
        let rap = node.puf(&nc);
        let reply = Message::new(node.id())
            .with_block(field::M2, &crypto::xor(&nc, &rap))
            .with_block(field::HASH2, &intro_hash2(&nc, &ra, &rap, &self.na));
        Ok((
            IntroAwaitingAck {
                peer: self.peer,
                na: self.na,
                ca,
                nc,
                rap,
            },
            reply,
        ))
    }
}

/// Target A, confirmation sent, waiting for C's ack.
#[derive(Debug)]
pub struct IntroAwaitingAck {
    peer: String,
    na: Block,
    ca: Block,
    nc: Block,
    rap: Block,
}

impl IntroAwaitingAck {
    /// Verify the ack and create the direct record `{c: NC}` for C.
    pub fn on_ack(self, node: &mut Node, msg: &Message) -> Result<AuthOutcome, ProtocolError> {
        if let Err(e) = self.verify_ack(msg) {
            warn!(node = node.id(), peer = %self.peer, error = %e, "supplementary ack rejected");
            self.store_with_fallback(node);
            return Err(e);
        }
        node.peers_mut().insert(
            &self.peer,
            PeerRecord {
                c: Some(self.nc),
                ..PeerRecord::default()
            },
        );
        info!(node = node.id(), peer = %self.peer, "introduced peer stored");
        Ok(AuthOutcome {
            peer: self.peer,
            session_key: None,
            recovered: false,
        })
    }

    /// Ack never arrived: store `c = NC` with the broker-issued challenge concealed.
    pub fn on_ack_lost(self, node: &mut Node, reason: &str) -> ProtocolError {
        warn!(node = node.id(), peer = %self.peer, reason, "supplementary ack not received");
        self.store_with_fallback(node);
        ProtocolError::TransportFailure(reason.to_string())
    }

    fn verify_ack(&self, msg: &Message) -> Result<(), ProtocolError> {
        msg.expect_from(&self.peer)?;
        let received = msg.block(field::HASH3)?;
        if !proofs_match(&received, &intro_hash3(&self.rap, &self.nc, &self.na)) {
            return Err(ProtocolError::HashMismatch {
                stage: Stage::Hash3,
            });
        }
        Ok(())
    }

    fn store_with_fallback(&self, node: &mut Node) {
        let concealed = node.conceal(&self.ca);
        node.peers_mut().insert(
            &self.peer,
            PeerRecord {
                c: Some(self.nc),
                fallback: Some(concealed),
                ..PeerRecord::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMode, ChallengeIssued, NonceSent};
    use crate::protocol::Value;

    fn harvested(bs: &mut BaseStation, a: &Node) {
        let (pending, request) = bs.begin_pre_enrollment(a.id());
        let reply = respond_pre_enrollment(a, &request).unwrap();
        assert_eq!(pending.on_responses(bs, &reply).unwrap(), DEFAULT_BATCH_SIZE);
    }

    /// BS harvests from A, hands one credential to C.
    fn introduced_setup() -> (BaseStation, Node, Node) {
        let mut bs = BaseStation::new("BS");
        let a = Node::new("A");
        let mut c = Node::new("C");
        harvested(&mut bs, &a);
        let handoff = bs.answer_request(&request_credential(&c, "A")).unwrap();
        assert_eq!(accept_credential(&mut c, &handoff).unwrap(), "A");
        (bs, a, c)
    }

    fn introduce(a: &mut Node, c: &mut Node) -> Result<(), ProtocolError> {
        let (intro, m_id) = IntroSent::start(c, a.id())?;
        let (target, m_na) = IntroNonceIssued::accept(a, &m_id)?;
        let (intro, m_proof) = intro.on_nonce(c, &m_na)?;
        let (target, m_confirm) = target.on_proof(a, &m_proof)?;
        let (_, m_ack) = intro.on_confirmation(c, &m_confirm)?;
        target.on_ack(a, &m_ack)?;
        Ok(())
    }

    #[test]
    fn pre_enrollment_harvests_matching_pairs() {
        let mut bs = BaseStation::new("BS");
        let a = Node::new("A");
        harvested(&mut bs, &a);
        assert_eq!(bs.remaining("A"), 5);
        for t in bs.credentials("A") {
            assert_eq!(t.c, bs.puf.process(&t.x));
            assert_eq!(t.r, a.puf(&t.c));
            assert!(!t.issued());
        }
        assert!(a.peers().is_empty());
    }

    #[test]
    fn pre_enrollment_rejects_wrong_count() {
        let mut bs = BaseStation::new("BS").with_batch_size(3);
        let a = Node::new("A");
        let (pending, _) = bs.begin_pre_enrollment("A");
        let short = Message::new("A").with_list(field::DATA, &[[0u8; 32]]);
        assert_eq!(
            pending.on_responses(&mut bs, &short),
            Err(ProtocolError::MalformedMessage { field: field::DATA })
        );
        assert_eq!(bs.remaining("A"), 0);
        let (pending, request) = bs.begin_pre_enrollment("A");
        let reply = respond_pre_enrollment(&a, &request).unwrap();
        assert_eq!(pending.on_responses(&mut bs, &reply).unwrap(), 3);
    }

    #[test]
    fn handoff_conceals_response() {
        let (bs, a, c) = introduced_setup();
        assert_eq!(bs.remaining("A"), 4);
        let issued = bs.credentials("A").iter().find(|t| t.issued()).unwrap();
        let rec = c.peers().record("A").unwrap();
        assert_eq!(rec.c, Some(issued.c));
        assert_eq!(rec.r, None);
        let hidden = rec.fallback.unwrap();
        assert_ne!(hidden.secret, issued.r);
        assert_eq!(crypto::xor(&c.puf(&hidden.x_lock), &hidden.secret), issued.r);
        assert_eq!(issued.r, a.puf(&issued.c));
    }

    #[test]
    fn credentials_are_issued_once() {
        let mut bs = BaseStation::new("BS");
        let a = Node::new("A");
        harvested(&mut bs, &a);
        let mut seen = Vec::new();
        for _ in 0..DEFAULT_BATCH_SIZE {
            let msg = bs.issue_credential("A").unwrap();
            let ca = msg.block(field::CA).unwrap();
            assert!(!seen.contains(&ca));
            seen.push(ca);
        }
        assert_eq!(
            bs.issue_credential("A"),
            Err(ProtocolError::CredentialsExhausted("A".into()))
        );
        assert_eq!(
            bs.issue_credential("Z"),
            Err(ProtocolError::PeerUnknown("Z".into()))
        );
    }

    #[test]
    fn supplementary_authentication_once() {
        let (_bs, mut a, mut c) = introduced_setup();
        introduce(&mut a, &mut c).unwrap();

        let ac = a.peers().record("C").unwrap().clone();
        let ca = c.peers().record("A").unwrap().clone();
        assert!(ac.fallback.is_none() && ca.fallback.is_none());
        assert_eq!(ac.c.unwrap(), c.puf(&ca.x.unwrap()));
        assert_eq!(ca.r.unwrap(), a.puf(&ac.c.unwrap()));

        // The concealed credential is gone, and A refuses a second introduction.
        assert_eq!(
            IntroSent::start(&c, "A").unwrap_err(),
            ProtocolError::NoFallbackAvailable
        );
        assert_eq!(
            IntroNonceIssued::accept(&a, &Message::new("C")).unwrap_err(),
            ProtocolError::DuplicatePeer("C".into())
        );
    }

    #[test]
    fn introduced_nodes_can_authenticate_directly() {
        let (_bs, mut a, mut c) = introduced_setup();
        introduce(&mut a, &mut c).unwrap();
        for _ in 0..3 {
            let (s, m0) = NonceSent::start(&a, "C", AuthMode::Plain).unwrap();
            let (r, m1) = ChallengeIssued::accept(&c, &m0, AuthMode::Plain).unwrap();
            let (s, m2) = s.on_challenge(&a, &m1).unwrap();
            let (_, m3) = r.on_confirmation(&mut c, &m2).unwrap();
            s.on_ack(&mut a, &m3).unwrap();
        }
    }

    #[test]
    fn tampered_proof_is_terminal() {
        let (_bs, a, c) = introduced_setup();
        let (intro, m_id) = IntroSent::start(&c, "A").unwrap();
        let (target, m_na) = IntroNonceIssued::accept(&a, &m_id).unwrap();
        let (_, mut m_proof) = intro.on_nonce(&c, &m_na).unwrap();
        let mut h = m_proof.block(field::HASH1).unwrap();
        h[5] ^= 0x80;
        m_proof.set(field::HASH1, Value::Bytes(h.to_vec()));
        assert_eq!(
            target.on_proof(&a, &m_proof).unwrap_err(),
            ProtocolError::HashMismatch { stage: Stage::Hash1 }
        );
        assert!(!a.peers().contains("C"));
    }

    #[test]
    fn proof_is_bound_to_claimed_identity() {
        let (_bs, a, c) = introduced_setup();
        let (intro, _) = IntroSent::start(&c, "A").unwrap();
        // A believes it is talking to D; C's proof arrives over that exchange.
        let (target, m_na) = IntroNonceIssued::accept(&a, &Message::new("D")).unwrap();
        let (_, mut m_proof) = intro.on_nonce(&c, &m_na).unwrap();
        m_proof.set(field::ID, Value::Text("D".into()));
        assert_eq!(
            target.on_proof(&a, &m_proof).unwrap_err(),
            ProtocolError::HashMismatch { stage: Stage::Hash1 }
        );
    }

    #[test]
    fn tampered_confirmation_leaves_introducer_untouched() {
        let (_bs, a, mut c) = introduced_setup();
        let before = c.peers().record("A").unwrap().clone();
        let (intro, m_id) = IntroSent::start(&c, "A").unwrap();
        let (target, m_na) = IntroNonceIssued::accept(&a, &m_id).unwrap();
        let (intro, m_proof) = intro.on_nonce(&c, &m_na).unwrap();
        let (_, mut m_confirm) = target.on_proof(&a, &m_proof).unwrap();
        let mut h = m_confirm.block(field::HASH2).unwrap();
        h[0] ^= 1;
        m_confirm.set(field::HASH2, Value::Bytes(h.to_vec()));
        assert!(intro.on_confirmation(&mut c, &m_confirm).is_err());
        assert_eq!(c.peers().record("A").unwrap(), &before);
    }

    #[test]
    fn lost_ack_stores_concealed_credential() {
        let (_bs, mut a, mut c) = introduced_setup();
        let (intro, m_id) = IntroSent::start(&c, "A").unwrap();
        let (target, m_na) = IntroNonceIssued::accept(&a, &m_id).unwrap();
        let (intro, m_proof) = intro.on_nonce(&c, &m_na).unwrap();
        let issued_ca = m_proof.block(field::CA).unwrap();
        let (target, m_confirm) = target.on_proof(&a, &m_proof).unwrap();
        intro.on_confirmation(&mut c, &m_confirm).unwrap();
        let err = target.on_ack_lost(&mut a, "timeout");
        assert!(matches!(err, ProtocolError::TransportFailure(_)));

        let rec = a.peers().record("C").unwrap();
        assert_eq!(a.reveal(&rec.fallback.unwrap()), issued_ca);
        assert_eq!(rec.c.unwrap(), c.puf(&c.peers().record("A").unwrap().x.unwrap()));
        assert!(matches!(
            IntroNonceIssued::accept(&a, &Message::new("C")),
            Err(ProtocolError::DuplicatePeer(_))
        ));
    }

    /// Run an introduction up to C's ack; returns A's pending state, the ack and the issued CA.
    fn up_to_ack(a: &Node, c: &mut Node) -> (IntroAwaitingAck, Message, Block) {
        let (intro, m_id) = IntroSent::start(c, "A").unwrap();
        let (target, m_na) = IntroNonceIssued::accept(a, &m_id).unwrap();
        let (intro, m_proof) = intro.on_nonce(c, &m_na).unwrap();
        let issued_ca = m_proof.block(field::CA).unwrap();
        let (target, m_confirm) = target.on_proof(a, &m_proof).unwrap();
        let (_, m_ack) = intro.on_confirmation(c, &m_confirm).unwrap();
        (target, m_ack, issued_ca)
    }

    #[test]
    fn tampered_ack_stores_concealed_credential() {
        let (_bs, mut a, mut c) = introduced_setup();
        let (target, mut m_ack, issued_ca) = up_to_ack(&a, &mut c);
        let mut h = m_ack.block(field::HASH3).unwrap();
        h[31] ^= 0x01;
        m_ack.set(field::HASH3, Value::Bytes(h.to_vec()));
        assert_eq!(
            target.on_ack(&mut a, &m_ack).unwrap_err(),
            ProtocolError::HashMismatch { stage: Stage::Hash3 }
        );

        let rec = a.peers().record("C").unwrap();
        let direct = c.peers().record("A").unwrap();
        assert_eq!(rec.c.unwrap(), c.puf(&direct.x.unwrap()));
        assert_eq!(a.reveal(&rec.fallback.unwrap()), issued_ca);
        assert_eq!(rec.x, None);
        assert_eq!(rec.r, None);
    }

    #[test]
    fn ack_from_wrong_sender_stores_concealed_credential() {
        let (_bs, mut a, mut c) = introduced_setup();
        let (target, mut m_ack, issued_ca) = up_to_ack(&a, &mut c);
        m_ack.set(field::ID, Value::Text("D".into()));
        assert!(matches!(
            target.on_ack(&mut a, &m_ack),
            Err(ProtocolError::UnexpectedPeer { .. })
        ));
        let rec = a.peers().record("C").unwrap();
        assert_eq!(a.reveal(&rec.fallback.unwrap()), issued_ca);
        assert!(rec.c.is_some());
    }

    #[test]
    fn handoff_for_known_peer_rejected() {
        let mut bs = BaseStation::new("BS");
        let a = Node::new("A");
        let mut c = Node::new("C");
        harvested(&mut bs, &a);
        c.peers_mut().insert("A", PeerRecord::default());
        let handoff = bs.issue_credential("A").unwrap();
        assert_eq!(
            accept_credential(&mut c, &handoff),
            Err(ProtocolError::DuplicatePeer("A".into()))
        );
    }

    #[test]
    fn introduction_needs_a_credential() {
        let c = Node::new("C");
        assert!(matches!(
            IntroSent::start(&c, "A"),
            Err(ProtocolError::PeerUnknown(_))
        ));
    }
}
