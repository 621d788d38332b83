//! Mutual re-authentication with challenge rotation, optional session-key establishment,
//! and one-generation desync recovery.
//!
//! ```text
//!   A (initiator, holds c = CA)                 B (responder, holds x = xA, r = RA)
//!   M0 = NA ^ CA                  -- M0 -->     CA = F_B(xA), NA = M0 ^ CA
//!                                               NB = F_B(gammaB), M1 = RA ^ NA ^ NB
//!   NB = M1 ^ NA ^ F_A(CA)     <-- M1,hash1 --  hash1 = H(CA, NB, RA, NA)
//!   RAp = F_A(NB), M2 = NA ^ RAp
//!   hash2 = H(NB, RA, RAp, NA)    -- M2,hash2 --> verify, x = gammaB, r = RAp
//!   verify, c = NB             <-- hash3 --     hash3 = H(RAp, NB, NA)
//! ```
//!
//! In session-key mode A also sends `MK = S ^ NA ^ NB`, both derive
//! `K = HKDF(salt = S, ikm = NA ‖ NB)`, and `K` is folded into hash2 and hash3.
//!
//! The responder commits its rotation as soon as hash2 verifies, before its ack is
//! delivered. The initiator commits `c = NB` even when the ack is lost, after concealing
//! the previous challenge so the next run can fall back to it.

use tracing::{debug, info, warn};

use crate::crypto::{self, proofs_match, Block, Transcript};
use crate::node::Node;
use crate::protocol::{field, Message, ProtocolError, Stage};

/// Whether a run also establishes a session key. Both sides must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    #[default]
    Plain,
    SessionKey,
}

/// Result of a completed run on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub peer: String,
    /// Shared key `K`, in session-key mode only.
    pub session_key: Option<Block>,
    /// The initiator had to fall back to its concealed previous challenge.
    pub recovered: bool,
}

fn hash1(ca: &Block, nb: &Block, ra: &Block, na: &Block) -> Block {
    Transcript::new()
        .block(ca)
        .block(nb)
        .block(ra)
        .block(na)
        .finalize()
}

fn hash2(nb: &Block, ra: &Block, rap: &Block, na: &Block, key: Option<&Block>) -> Block {
    let t = Transcript::new().block(nb).block(ra).block(rap).block(na);
    match key {
        Some(k) => t.block(k).finalize(),
        None => t.finalize(),
    }
}

fn hash3(rap: &Block, nb: &Block, na: &Block, key: Option<&Block>) -> Block {
    let t = Transcript::new().block(rap);
    let t = match key {
        Some(k) => t.block(k),
        None => t,
    };
    t.block(nb).block(na).finalize()
}

/// Initiator, nonce sent, waiting for the responder's challenge.
#[derive(Debug)]
pub struct NonceSent {
    peer: String,
    mode: AuthMode,
    na: Block,
    ca: Block,
    m0: Block,
}

impl NonceSent {
    /// Mask a fresh nonce with the stored challenge for `peer`.
    pub fn start(node: &Node, peer: &str, mode: AuthMode) -> Result<(Self, Message), ProtocolError> {
        let record = node.peers().record(peer)?;
        let ca = record.c.ok_or_else(|| ProtocolError::NotEnrolled {
            peer: peer.to_string(),
            field: "c",
        })?;
        let na = crypto::random_block();
        let m0 = crypto::xor(&na, &ca);
        debug!(node = node.id(), peer, ?mode, "authentication started");
        let msg = Message::new(node.id()).with_block(field::M0, &m0);
        Ok((
            Self {
                peer: peer.to_string(),
                mode,
                na,
                ca,
                m0,
            },
            msg,
        ))
    }

    /// Verify the responder (hash1), falling back to the concealed previous challenge if
    /// the current one does not match. On success returns the confirmation message.
    /// The store is not modified here.
    pub fn on_challenge(
        self,
        node: &Node,
        msg: &Message,
    ) -> Result<(AwaitingAck, Message), ProtocolError> {
        msg.expect_from(&self.peer)?;
        let m1 = msg.block(field::M1)?;
        let received = msg.block(field::HASH1)?;

        let mut ca = self.ca;
        let mut na = self.na;
        let mut ra = node.puf(&ca);
        let mut nb = crypto::xor3(&m1, &na, &ra);
        let mut recovered = false;

        if !proofs_match(&received, &hash1(&ca, &nb, &ra, &na)) {
            let fallback = node
                .peers()
                .record(&self.peer)?
                .fallback
                .ok_or_else(|| {
                    warn!(node = node.id(), peer = %self.peer, "hash1 mismatch, no fallback challenge");
                    ProtocolError::NoFallbackAvailable
                })?;
            let ca_old = node.reveal(&fallback);
            let na_old = crypto::xor(&self.m0, &ca_old);
            let ra_old = node.puf(&ca_old);
            let nb_old = crypto::xor3(&m1, &ra_old, &na_old);
            if !proofs_match(&received, &hash1(&ca_old, &nb_old, &ra_old, &na_old)) {
                warn!(node = node.id(), peer = %self.peer, "hash1 mismatch with old challenge too");
                return Err(ProtocolError::HashMismatch {
                    stage: Stage::Hash1,
                });
            }
            warn!(node = node.id(), peer = %self.peer, "responder verified with old challenge");
            ca = ca_old;
            na = na_old;
            ra = ra_old;
            nb = nb_old;
            recovered = true;
        }
        debug!(node = node.id(), peer = %self.peer, recovered, "responder verified");

        let rap = node.puf(&nb);
        let mut reply = Message::new(node.id()).with_block(field::M2, &crypto::xor(&na, &rap));
        let session_key = match self.mode {
            AuthMode::Plain => None,
            AuthMode::SessionKey => {
                let s = crypto::random_block();
                reply = reply.with_block(field::MK, &crypto::xor3(&s, &na, &nb));
                Some(crypto::derive_session_key(&na, &nb, &s))
            }
        };
        let reply = reply.with_block(field::HASH2, &hash2(&nb, &ra, &rap, &na, session_key.as_ref()));

        Ok((
            AwaitingAck {
                peer: self.peer,
                na,
                ca,
                nb,
                rap,
                session_key,
                recovered,
            },
            reply,
        ))
    }
}

/// Initiator, confirmation sent, waiting for the responder's ack (hash3).
#[derive(Debug)]
pub struct AwaitingAck {
    peer: String,
    na: Block,
    ca: Block,
    nb: Block,
    rap: Block,
    session_key: Option<Block>,
    recovered: bool,
}

impl AwaitingAck {
    /// Verify the ack and commit `c = NB`. Any failure takes the same path as a lost ack.
    pub fn on_ack(self, node: &mut Node, msg: &Message) -> Result<AuthOutcome, ProtocolError> {
        if let Err(e) = self.verify_ack(msg) {
            warn!(node = node.id(), peer = %self.peer, error = %e, "ack rejected");
            self.conceal_and_rotate(node)?;
            return Err(e);
        }
        let nb = self.nb;
        node.peers_mut().update(&self.peer, |rec| {
            rec.c = Some(nb);
            rec.fallback = None;
        })?;
        info!(node = node.id(), peer = %self.peer, recovered = self.recovered, "authenticated, challenge rotated");
        Ok(AuthOutcome {
            peer: self.peer,
            session_key: self.session_key,
            recovered: self.recovered,
        })
    }

    /// No ack arrived (timeout, closed connection, I/O error). Conceals the current challenge,
    /// rotates anyway, and reports the run as failed.
    pub fn on_ack_lost(self, node: &mut Node, reason: &str) -> ProtocolError {
        warn!(node = node.id(), peer = %self.peer, reason, "ack not received");
        match self.conceal_and_rotate(node) {
            Ok(()) => ProtocolError::TransportFailure(reason.to_string()),
            Err(e) => e,
        }
    }

    fn verify_ack(&self, msg: &Message) -> Result<(), ProtocolError> {
        msg.expect_from(&self.peer)?;
        let received = msg.block(field::HASH3)?;
        let expected = hash3(&self.rap, &self.nb, &self.na, self.session_key.as_ref());
        if !proofs_match(&received, &expected) {
            return Err(ProtocolError::HashMismatch {
                stage: Stage::Hash3,
            });
        }
        Ok(())
    }

    fn conceal_and_rotate(&self, node: &mut Node) -> Result<(), ProtocolError> {
        let concealed = node.conceal(&self.ca);
        let nb = self.nb;
        node.peers_mut().update(&self.peer, |rec| {
            rec.fallback = Some(concealed);
            rec.c = Some(nb);
        })?;
        debug!(node = node.id(), peer = %self.peer, "previous challenge concealed, c rotated");
        Ok(())
    }
}

/// Responder, challenge issued, waiting for the initiator's confirmation.
#[derive(Debug)]
pub struct ChallengeIssued {
    peer: String,
    mode: AuthMode,
    na: Block,
    nb: Block,
    gamma: Block,
    ra: Block,
}

impl ChallengeIssued {
    /// Answer an initiation `{id, M0}` from an enrolled peer.
    pub fn accept(node: &Node, msg: &Message, mode: AuthMode) -> Result<(Self, Message), ProtocolError> {
        msg.check_error()?;
        let peer = msg.id()?;
        let m0 = msg.block(field::M0)?;
        let record = node.peers().record(peer)?;
        let xa = record.x.ok_or_else(|| ProtocolError::NotEnrolled {
            peer: peer.to_string(),
            field: "x",
        })?;
        let ra = record.r.ok_or_else(|| ProtocolError::NotEnrolled {
            peer: peer.to_string(),
            field: "r",
        })?;

        let ca = node.puf(&xa);
        let na = crypto::xor(&m0, &ca);
        let gamma = crypto::random_block();
        let nb = node.puf(&gamma);
        let reply = Message::new(node.id())
            .with_block(field::M1, &crypto::xor3(&ra, &na, &nb))
            .with_block(field::HASH1, &hash1(&ca, &nb, &ra, &na));
        debug!(node = node.id(), peer, ?mode, "authentication challenge issued");
        Ok((
            Self {
                peer: peer.to_string(),
                mode,
                na,
                nb,
                gamma,
                ra,
            },
            reply,
        ))
    }

    /// Verify hash2, commit `x = gammaB, r = RAp`, and build the ack. No fallback on this side.
    pub fn on_confirmation(
        self,
        node: &mut Node,
        msg: &Message,
    ) -> Result<(AuthOutcome, Message), ProtocolError> {
        msg.expect_from(&self.peer)?;
        let m2 = msg.block(field::M2)?;
        let received = msg.block(field::HASH2)?;
        let rap = crypto::xor(&m2, &self.na);
        let session_key = match self.mode {
            AuthMode::Plain => None,
            AuthMode::SessionKey => {
                let mk = msg.block(field::MK)?;
                let s = crypto::xor3(&mk, &self.na, &self.nb);
                Some(crypto::derive_session_key(&self.na, &self.nb, &s))
            }
        };
        let expected = hash2(&self.nb, &self.ra, &rap, &self.na, session_key.as_ref());
        if !proofs_match(&received, &expected) {
            warn!(node = node.id(), peer = %self.peer, "hash2 mismatch");
            return Err(ProtocolError::HashMismatch {
                stage: Stage::Hash2,
            });
        }

        let gamma = self.gamma;
        node.peers_mut().update(&self.peer, |rec| {
            rec.x = Some(gamma);
            rec.r = Some(rap);
        })?;
        info!(node = node.id(), peer = %self.peer, "initiator verified, x and r rotated");

        let ack = Message::new(node.id()).with_block(
            field::HASH3,
            &hash3(&rap, &self.nb, &self.na, session_key.as_ref()),
        );
        Ok((
            AuthOutcome {
                peer: self.peer,
                session_key,
                recovered: false,
            },
            ack,
        ))
    }
}
