//! Enrollment: one-time bootstrap of a challenge/response pair, one direction per pass.
//!
//! Initiator I sends `{id, C = F_I(x)}`; responder R stores `c = C` and answers
//! `{id, R = F_R(C)}`; I keeps `x` and `r = R`. Running a pass in each direction gives
//! both nodes a complete record for the other.

use tracing::{debug, info};

use crate::crypto::{self, Block};
use crate::node::Node;
use crate::protocol::{field, Message, ProtocolError};

/// Initiator side, waiting for the responder's answer.
#[derive(Debug)]
pub struct EnrollInitiator {
    peer: String,
    x: Block,
}

impl EnrollInitiator {
    /// Pick a seed and build the challenge message for `peer`.
    pub fn start(node: &Node, peer: &str) -> (Self, Message) {
        let x = crypto::random_block();
        let challenge = node.puf(&x);
        debug!(node = node.id(), peer, "enrollment challenge issued");
        let msg = Message::new(node.id()).with_block(field::C, &challenge);
        (
            Self {
                peer: peer.to_string(),
                x,
            },
            msg,
        )
    }

    /// Store the seed and the peer's response. Nothing is written if the reply is unusable.
    pub fn finish(self, node: &mut Node, reply: &Message) -> Result<(), ProtocolError> {
        reply.expect_from(&self.peer)?;
        let response = reply.block(field::R)?;
        let x = self.x;
        node.peers_mut().upsert(&self.peer, |rec| {
            rec.x = Some(x);
            rec.r = Some(response);
        });
        info!(node = node.id(), peer = %self.peer, "enrolled peer (x, r stored)");
        Ok(())
    }
}

/// Responder side: store the received challenge and answer it with the local function.
/// Returns the initiator's id and the reply to send.
pub fn respond(node: &mut Node, request: &Message) -> Result<(String, Message), ProtocolError> {
    request.check_error()?;
    let peer = request.id()?.to_string();
    let challenge = request.block(field::C)?;
    node.peers_mut().upsert(&peer, |rec| rec.c = Some(challenge));
    let response = node.puf(&challenge);
    info!(node = node.id(), peer = %peer, "answered enrollment challenge (c stored)");
    Ok((peer, Message::new(node.id()).with_block(field::R, &response)))
}

/// Run one pass `initiator -> responder` in memory.
#[cfg(test)]
pub(crate) fn enroll_pass(initiator: &mut Node, responder: &mut Node) {
    let (pending, challenge) = EnrollInitiator::start(initiator, responder.id());
    let (peer, reply) = respond(responder, &challenge).unwrap();
    assert_eq!(peer, initiator.id());
    pending.finish(initiator, &reply).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_enrollment_matches_device_functions() {
        let mut a = Node::new("A");
        let mut b = Node::new("B");
        enroll_pass(&mut a, &mut b);
        enroll_pass(&mut b, &mut a);

        let ab = a.peers().record("B").unwrap().clone();
        let ba = b.peers().record("A").unwrap().clone();

        // A issued F_A(x) to B and learned B's answer.
        assert_eq!(ab.r.unwrap(), b.puf(&a.puf(&ab.x.unwrap())));
        assert_eq!(ba.r.unwrap(), a.puf(&b.puf(&ba.x.unwrap())));
        // Each side's c is the challenge the other derived from its seed.
        assert_eq!(ab.c.unwrap(), b.puf(&ba.x.unwrap()));
        assert_eq!(ba.c.unwrap(), a.puf(&ab.x.unwrap()));
        assert!(ab.fallback.is_none() && ba.fallback.is_none());
    }

    #[test]
    fn enrollment_order_is_irrelevant() {
        let mut a = Node::new("A");
        let mut b = Node::new("B");
        enroll_pass(&mut b, &mut a);
        enroll_pass(&mut a, &mut b);
        let ab = a.peers().record("B").unwrap();
        assert!(ab.x.is_some() && ab.c.is_some() && ab.r.is_some());
    }

    #[test]
    fn missing_response_mutates_nothing() {
        let mut a = Node::new("A");
        let (pending, _) = EnrollInitiator::start(&a, "B");
        let reply = Message::new("B");
        assert_eq!(
            pending.finish(&mut a, &reply),
            Err(ProtocolError::MalformedMessage { field: field::R })
        );
        assert!(a.peers().get("B").is_none());
    }

    #[test]
    fn reply_from_wrong_peer_rejected() {
        let mut a = Node::new("A");
        let mut c = Node::new("C");
        let (pending, challenge) = EnrollInitiator::start(&a, "B");
        let (_, reply) = respond(&mut c, &challenge).unwrap();
        assert!(matches!(
            pending.finish(&mut a, &reply),
            Err(ProtocolError::UnexpectedPeer { .. })
        ));
        assert!(a.peers().is_empty());
    }

    #[test]
    fn malformed_challenge_rejected() {
        let mut b = Node::new("B");
        let bad = Message::new("A");
        assert!(matches!(
            respond(&mut b, &bad),
            Err(ProtocolError::MalformedMessage { field: "C" })
        ));
        assert!(b.peers().is_empty());
        assert!(respond(&mut b, &Message::error("A", "aborted")).is_err());
    }
}
