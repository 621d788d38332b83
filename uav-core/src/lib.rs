//! PUF-based mutual authentication for UAV swarms.
//! Host-driven: no I/O; the host moves messages between the state machines and the network.

pub mod auth;
pub mod crypto;
pub mod delegation;
pub mod enrollment;
pub mod node;
pub mod protocol;
pub mod puf;
pub mod store;
pub mod wire;

pub use auth::{AuthMode, AuthOutcome, AwaitingAck, ChallengeIssued, NonceSent};
pub use crypto::{Block, BLOCK_SIZE};
pub use delegation::{
    accept_credential, request_credential, respond_pre_enrollment, BaseStation, IntroAwaitingAck,
    IntroNonceIssued, IntroSent, PreEnrollment, ProofSent,
};
pub use enrollment::EnrollInitiator;
pub use node::Node;
pub use protocol::{field, Message, ProtocolError, Stage, Value};
pub use puf::DeviceFunction;
pub use store::{Concealed, PeerRecord, PeerStore};
pub use wire::{decode_frame, encode_frame, BincodeCodec, Codec, FrameDecodeError, FrameEncodeError, JsonCodec};
