use crate::keypair::{self, keccak256, Address, Keypair, Signature};
use crate::model::{OrderId, Secret, Timestamp, TokenAmount};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rlp::{Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WIRE_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Envelope is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("Wire version mismatch, want {WIRE_VERSION} got {0}")]
    VersionMismatch(u32),
    #[error("Unknown message tag `{0}`")]
    UnknownTag(String),
    #[error("Envelope data is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("RLP decoding failed")]
    Rlp(#[from] rlp::DecoderError),
    #[error("Command id mismatch, want {expected} got {got}")]
    CmdidMismatch { expected: u32, got: u32 },
    #[error("{0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Signature(#[from] keypair::Error),
}

/// A message body with a stable command id and RLP field layout.
///
/// The unsigned serialization of a payload is the RLP list of its fields
/// followed by the command id; its keccak hash is what gets signed.
pub trait Payload: Sized {
    const CMDID: u32;
    const TAG: &'static str;

    fn field_count() -> usize;
    fn append_fields(&self, s: &mut RlpStream);
    fn decode_fields(rlp: &Rlp) -> Result<Self, Error>;
}

pub fn unsigned_rlp<T: Payload>(payload: &T) -> Vec<u8> {
    let mut s = RlpStream::new_list(T::field_count() + 1);
    payload.append_fields(&mut s);
    append_u32(&mut s, T::CMDID);

    s.out().to_vec()
}

/// keccak of the signature-free serialization; the digest that gets signed.
pub fn payload_hash<T: Payload>(payload: &T) -> [u8; 32] {
    keccak256(&unsigned_rlp(payload))
}

fn signed_rlp<T: Payload>(message: &Signed<T>) -> Vec<u8> {
    let mut s = RlpStream::new_list(T::field_count() + 2);
    message.payload.append_fields(&mut s);
    append_bytes(&mut s, &message.signature.as_bytes()[..]);
    append_u32(&mut s, T::CMDID);

    s.out().to_vec()
}

fn decode_unsigned<T: Payload>(rlp: &Rlp) -> Result<T, Error> {
    if rlp.item_count()? != T::field_count() + 1 {
        return Err(Error::Malformed("unexpected field count"));
    }

    let payload = T::decode_fields(rlp)?;
    check_cmdid::<T>(rlp, T::field_count())?;

    Ok(payload)
}

fn decode_signed<T: Payload>(rlp: &Rlp) -> Result<Signed<T>, Error> {
    if rlp.item_count()? != T::field_count() + 2 {
        return Err(Error::Malformed("unexpected field count"));
    }

    let payload = T::decode_fields(rlp)?;
    let signature = Signature::from_bytes(fixed_at::<65>(rlp, T::field_count())?);
    check_cmdid::<T>(rlp, T::field_count() + 1)?;

    Ok(Signed { payload, signature })
}

fn check_cmdid<T: Payload>(rlp: &Rlp, index: usize) -> Result<(), Error> {
    let got = u32_at(rlp, index)?;

    if got != T::CMDID {
        return Err(Error::CmdidMismatch {
            expected: T::CMDID,
            got,
        });
    }

    Ok(())
}

/// A payload plus the 65-byte recoverable signature of its author.
#[derive(Debug, Clone, PartialEq)]
pub struct Signed<T> {
    pub payload: T,
    pub signature: Signature,
}

impl<T: Payload> Signed<T> {
    pub fn new(payload: T, keypair: &Keypair) -> Self {
        let signature = keypair.sign(payload_hash(&payload));

        Self { payload, signature }
    }

    pub fn hash_without_signature(&self) -> [u8; 32] {
        payload_hash(&self.payload)
    }

    /// Recovers the author of the message from its signature.
    pub fn sender(&self) -> Result<Address, Error> {
        Ok(self.signature.recover(self.hash_without_signature())?)
    }

    /// Ensures the message was signed by `expected`.
    pub fn verify(&self, expected: Address) -> Result<(), Error> {
        if self.sender()? != expected {
            return Err(Error::Malformed("unexpected signer"));
        }

        Ok(())
    }
}

// Concrete messages. Aliases bind the payload structs to their signed form.

pub type Commitment = Signed<CommitmentMsg>;
pub type CommitmentProof = Signed<CommitmentProofMsg>;
pub type ProvenOrder = Signed<ProvenOrderMsg>;
pub type ProvenCommitment = Signed<ProvenCommitmentMsg>;
pub type ServiceAdvertisement = Signed<ServiceAdvertisementMsg>;
pub type SwapExecution = Signed<SwapExecutionMsg>;
pub type SwapCompleted = Signed<SwapCompletedMsg>;
pub type OfferTaken = Signed<OfferTakenMsg>;
pub type Cancellation = Signed<CancellationMsg>;
pub type CancellationProof = Signed<CancellationProofMsg>;

/// The plain, unsigned description of an order as it appears on the market.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderMessage {
    pub ask_token: Address,
    pub ask_amount: TokenAmount,
    pub bid_token: Address,
    pub bid_amount: TokenAmount,
    pub order_id: OrderId,
    pub timeout: Timestamp,
}

impl OrderMessage {
    pub fn hash(&self) -> [u8; 32] {
        payload_hash(self)
    }

    pub fn timed_out(&self, at: Timestamp) -> bool {
        self.timeout < at
    }
}

impl Payload for OrderMessage {
    const CMDID: u32 = 1;
    const TAG: &'static str = "offer";

    fn field_count() -> usize {
        6
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_address(s, self.ask_token);
        append_uint(s, self.ask_amount);
        append_address(s, self.bid_token);
        append_uint(s, self.bid_amount);
        append_u32(s, self.order_id.to_u32());
        append_timestamp(s, self.timeout);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            ask_token: address_at(rlp, 0)?,
            ask_amount: uint_at(rlp, 1)?,
            bid_token: address_at(rlp, 2)?,
            bid_amount: uint_at(rlp, 3)?,
            order_id: OrderId::new(u32_at(rlp, 4)?),
            timeout: timestamp_at(rlp, 5)?,
        })
    }
}

/// A promise to execute the swap behind `order_id`, backed by a fee-token
/// deposit of `amount` with the commitment service.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitmentMsg {
    pub order_id: OrderId,
    pub order_hash: [u8; 32],
    pub timeout: Timestamp,
    pub amount: TokenAmount,
}

impl Payload for CommitmentMsg {
    const CMDID: u32 = 4;
    const TAG: &'static str = "commitment";

    fn field_count() -> usize {
        4
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_u32(s, self.order_id.to_u32());
        append_fixed(s, &self.order_hash);
        append_timestamp(s, self.timeout);
        append_uint(s, self.amount);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            order_id: OrderId::new(u32_at(rlp, 0)?),
            order_hash: fixed_at::<32>(rlp, 1)?,
            timeout: timestamp_at(rlp, 2)?,
            amount: uint_at(rlp, 3)?,
        })
    }
}

/// The commitment service's acknowledgement of an escrowed commitment,
/// carrying the hash-lock secret for the swap.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitmentProofMsg {
    pub commitment_sig: Signature,
    pub secret: Secret,
    pub secret_hash: [u8; 32],
    pub offer_id: OrderId,
}

impl Payload for CommitmentProofMsg {
    const CMDID: u32 = 5;
    const TAG: &'static str = "commitment_proof";

    fn field_count() -> usize {
        4
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_bytes(s, &self.commitment_sig.as_bytes()[..]);
        append_fixed(s, self.secret.as_bytes());
        append_fixed(s, &self.secret_hash);
        append_u32(s, self.offer_id.to_u32());
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            commitment_sig: Signature::from_bytes(fixed_at::<65>(rlp, 0)?),
            secret: Secret::from_bytes(fixed_at::<32>(rlp, 1)?),
            secret_hash: fixed_at::<32>(rlp, 2)?,
            offer_id: OrderId::new(u32_at(rlp, 3)?),
        })
    }
}

/// An order with the service proof attached, published by its maker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvenOrderMsg {
    pub order: OrderMessage,
    pub proof: CommitmentProof,
}

impl Payload for ProvenOrderMsg {
    const CMDID: u32 = 2;
    const TAG: &'static str = "proven_offer";

    fn field_count() -> usize {
        2
    }

    fn append_fields(&self, s: &mut RlpStream) {
        s.append_raw(&unsigned_rlp(&self.order), 1);
        s.append_raw(&signed_rlp(&self.proof), 1);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            order: decode_unsigned(&rlp.at(0)?)?,
            proof: decode_signed(&rlp.at(1)?)?,
        })
    }
}

/// Sent from taker to maker: the taker's commitment plus the service proof
/// that it is escrowed, establishing the pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvenCommitmentMsg {
    pub commitment: Commitment,
    pub proof: CommitmentProof,
}

impl Payload for ProvenCommitmentMsg {
    const CMDID: u32 = 3;
    const TAG: &'static str = "proven_commitment";

    fn field_count() -> usize {
        2
    }

    fn append_fields(&self, s: &mut RlpStream) {
        s.append_raw(&signed_rlp(&self.commitment), 1);
        s.append_raw(&signed_rlp(&self.proof), 1);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            commitment: decode_signed(&rlp.at(0)?)?,
            proof: decode_signed(&rlp.at(1)?)?,
        })
    }
}

/// Broadcast by the commitment service so nodes can discover it, the fee
/// token it escrows and the fee rate it charges (fraction of 2^32).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAdvertisementMsg {
    pub address: Address,
    pub commitment_token: Address,
    pub fee_rate: u32,
}

impl Payload for ServiceAdvertisementMsg {
    const CMDID: u32 = 6;
    const TAG: &'static str = "commitment_service";

    fn field_count() -> usize {
        3
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_address(s, self.address);
        append_address(s, self.commitment_token);
        append_u32(s, self.fee_rate);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            address: address_at(rlp, 0)?,
            commitment_token: address_at(rlp, 1)?,
            fee_rate: u32_at(rlp, 2)?,
        })
    }
}

/// A party's confirmation towards the service that the swap went through.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapExecutionMsg {
    pub offer_id: OrderId,
    pub timestamp: Timestamp,
}

impl Payload for SwapExecutionMsg {
    const CMDID: u32 = 7;
    const TAG: &'static str = "swap_executed";

    fn field_count() -> usize {
        2
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_uint(s, self.offer_id.to_u32() as u128);
        append_timestamp(s, self.timestamp);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        let offer_id = uint_at(rlp, 0)?;
        if offer_id > u32::MAX as u128 {
            return Err(Error::Malformed("offer id out of range"));
        }

        Ok(Self {
            offer_id: OrderId::new(offer_id as u32),
            timestamp: timestamp_at(rlp, 1)?,
        })
    }
}

/// Broadcast by the service once both sides confirmed; feeds trade history.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapCompletedMsg {
    pub offer_id: OrderId,
    pub timestamp: Timestamp,
}

impl Payload for SwapCompletedMsg {
    const CMDID: u32 = 8;
    const TAG: &'static str = "swap_completed";

    fn field_count() -> usize {
        2
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_uint(s, self.offer_id.to_u32() as u128);
        append_timestamp(s, self.timestamp);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        let offer_id = uint_at(rlp, 0)?;
        if offer_id > u32::MAX as u128 {
            return Err(Error::Malformed("offer id out of range"));
        }

        Ok(Self {
            offer_id: OrderId::new(offer_id as u32),
            timestamp: timestamp_at(rlp, 1)?,
        })
    }
}

/// Broadcast by the service as soon as a taker is engaged, so the order
/// disappears from remote books.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferTakenMsg {
    pub offer_id: OrderId,
}

impl Payload for OfferTakenMsg {
    const CMDID: u32 = 9;
    const TAG: &'static str = "offer_taken";

    fn field_count() -> usize {
        1
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_u32(s, self.offer_id.to_u32());
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            offer_id: OrderId::new(u32_at(rlp, 0)?),
        })
    }
}

/// A maker's request to withdraw its commitment before a match.
#[derive(Debug, Clone, PartialEq)]
pub struct CancellationMsg {
    pub offer_id: OrderId,
}

impl Payload for CancellationMsg {
    const CMDID: u32 = 10;
    const TAG: &'static str = "cancellation";

    fn field_count() -> usize {
        1
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_u32(s, self.offer_id.to_u32());
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            offer_id: OrderId::new(u32_at(rlp, 0)?),
        })
    }
}

/// The service's confirmation of a cancellation, wrapping the original
/// commitment proof.
#[derive(Debug, Clone, PartialEq)]
pub struct CancellationProofMsg {
    pub offer_id: OrderId,
    pub cancellation_proof: CommitmentProof,
}

impl Payload for CancellationProofMsg {
    const CMDID: u32 = 11;
    const TAG: &'static str = "cancellation_proof";

    fn field_count() -> usize {
        2
    }

    fn append_fields(&self, s: &mut RlpStream) {
        append_u32(s, self.offer_id.to_u32());
        s.append_raw(&signed_rlp(&self.cancellation_proof), 1);
    }

    fn decode_fields(rlp: &Rlp) -> Result<Self, Error> {
        Ok(Self {
            offer_id: OrderId::new(u32_at(rlp, 0)?),
            cancellation_proof: decode_signed(&rlp.at(1)?)?,
        })
    }
}

/// Any message that can travel in an envelope.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    Order(OrderMessage),
    ProvenOrder(ProvenOrder),
    ProvenCommitment(ProvenCommitment),
    Commitment(Commitment),
    CommitmentProof(CommitmentProof),
    ServiceAdvertisement(ServiceAdvertisement),
    SwapExecution(SwapExecution),
    SwapCompleted(SwapCompleted),
    OfferTaken(OfferTaken),
    Cancellation(Cancellation),
    CancellationProof(CancellationProof),
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Order(_) => OrderMessage::TAG,
            Message::ProvenOrder(_) => ProvenOrderMsg::TAG,
            Message::ProvenCommitment(_) => ProvenCommitmentMsg::TAG,
            Message::Commitment(_) => CommitmentMsg::TAG,
            Message::CommitmentProof(_) => CommitmentProofMsg::TAG,
            Message::ServiceAdvertisement(_) => ServiceAdvertisementMsg::TAG,
            Message::SwapExecution(_) => SwapExecutionMsg::TAG,
            Message::SwapCompleted(_) => SwapCompletedMsg::TAG,
            Message::OfferTaken(_) => OfferTakenMsg::TAG,
            Message::Cancellation(_) => CancellationMsg::TAG,
            Message::CancellationProof(_) => CancellationProofMsg::TAG,
        }
    }

    fn to_rlp(&self) -> Vec<u8> {
        match self {
            Message::Order(m) => unsigned_rlp(m),
            Message::ProvenOrder(m) => signed_rlp(m),
            Message::ProvenCommitment(m) => signed_rlp(m),
            Message::Commitment(m) => signed_rlp(m),
            Message::CommitmentProof(m) => signed_rlp(m),
            Message::ServiceAdvertisement(m) => signed_rlp(m),
            Message::SwapExecution(m) => signed_rlp(m),
            Message::SwapCompleted(m) => signed_rlp(m),
            Message::OfferTaken(m) => signed_rlp(m),
            Message::Cancellation(m) => signed_rlp(m),
            Message::CancellationProof(m) => signed_rlp(m),
        }
    }

    fn from_rlp(tag: &str, bytes: &[u8]) -> Result<Self, Error> {
        let rlp = Rlp::new(bytes);

        let message = if tag == OrderMessage::TAG {
            Message::Order(decode_unsigned(&rlp)?)
        } else if tag == ProvenOrderMsg::TAG {
            Message::ProvenOrder(decode_signed(&rlp)?)
        } else if tag == ProvenCommitmentMsg::TAG {
            Message::ProvenCommitment(decode_signed(&rlp)?)
        } else if tag == CommitmentMsg::TAG {
            Message::Commitment(decode_signed(&rlp)?)
        } else if tag == CommitmentProofMsg::TAG {
            Message::CommitmentProof(decode_signed(&rlp)?)
        } else if tag == ServiceAdvertisementMsg::TAG {
            Message::ServiceAdvertisement(decode_signed(&rlp)?)
        } else if tag == SwapExecutionMsg::TAG {
            Message::SwapExecution(decode_signed(&rlp)?)
        } else if tag == SwapCompletedMsg::TAG {
            Message::SwapCompleted(decode_signed(&rlp)?)
        } else if tag == OfferTakenMsg::TAG {
            Message::OfferTaken(decode_signed(&rlp)?)
        } else if tag == CancellationMsg::TAG {
            Message::Cancellation(decode_signed(&rlp)?)
        } else if tag == CancellationProofMsg::TAG {
            Message::CancellationProof(decode_signed(&rlp)?)
        } else {
            return Err(Error::UnknownTag(tag.to_owned()));
        };

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    version: u32,
    msg: String,
    data: String,
}

/// The JSON envelope every broker payload travels in: the message tag next
/// to the base64 of the RLP body.
pub struct Envelope;

impl Envelope {
    pub fn seal(message: &Message) -> String {
        let envelope = EnvelopeJson {
            version: WIRE_VERSION,
            msg: message.tag().to_owned(),
            data: BASE64.encode(message.to_rlp()),
        };

        serde_json::to_string(&envelope).expect("envelope serialization not to fail")
    }

    pub fn open(data: &str) -> Result<Message, Error> {
        let envelope: EnvelopeJson = serde_json::from_str(data)?;

        if envelope.version != WIRE_VERSION {
            return Err(Error::VersionMismatch(envelope.version));
        }

        let bytes = BASE64.decode(envelope.data)?;

        Message::from_rlp(&envelope.msg, &bytes)
    }
}

// RLP item helpers. int32 fields are fixed 4-byte big-endian strings,
// int256 fields are minimal big-endian strings.

fn append_bytes(s: &mut RlpStream, bytes: &[u8]) {
    s.append(&bytes.to_vec());
}

fn append_fixed<const N: usize>(s: &mut RlpStream, bytes: &[u8; N]) {
    append_bytes(s, &bytes[..]);
}

fn append_address(s: &mut RlpStream, address: Address) {
    append_fixed(s, address.as_bytes());
}

fn append_u32(s: &mut RlpStream, value: u32) {
    append_bytes(s, &value.to_be_bytes());
}

fn append_uint(s: &mut RlpStream, value: u128) {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());

    append_bytes(s, &bytes[start..]);
}

fn append_timestamp(s: &mut RlpStream, value: Timestamp) {
    append_uint(s, value.millis().max(0) as u128);
}

fn bytes_at(rlp: &Rlp, index: usize) -> Result<Vec<u8>, Error> {
    Ok(rlp.val_at::<Vec<u8>>(index)?)
}

fn fixed_at<const N: usize>(rlp: &Rlp, index: usize) -> Result<[u8; N], Error> {
    let bytes = bytes_at(rlp, index)?;

    bytes
        .try_into()
        .map_err(|_| Error::Malformed("fixed-width field has wrong length"))
}

fn address_at(rlp: &Rlp, index: usize) -> Result<Address, Error> {
    Ok(Address::from_bytes(fixed_at::<20>(rlp, index)?))
}

fn u32_at(rlp: &Rlp, index: usize) -> Result<u32, Error> {
    Ok(u32::from_be_bytes(fixed_at::<4>(rlp, index)?))
}

fn uint_at(rlp: &Rlp, index: usize) -> Result<TokenAmount, Error> {
    let bytes = bytes_at(rlp, index)?;

    if bytes.len() > 16 {
        return Err(Error::Malformed("integer field is too wide"));
    }

    Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
}

fn timestamp_at(rlp: &Rlp, index: usize) -> Result<Timestamp, Error> {
    let millis = uint_at(rlp, index)?;

    if millis > i64::MAX as u128 {
        return Err(Error::Malformed("timestamp out of range"));
    }

    Ok(Timestamp::new(millis as i64))
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn dummy_commitment_proof() -> CommitmentProof {
        let keypair = Keypair::from_seed("commitment service").unwrap();
        let secret = Secret::random();

        Signed::new(
            CommitmentProofMsg {
                commitment_sig: keypair.sign(keccak256(b"commitment")),
                secret_hash: secret.hash(),
                secret,
                offer_id: OrderId::new(7),
            },
            &keypair,
        )
    }

    pub fn dummy_cancellation_proof() -> CancellationProof {
        let keypair = Keypair::from_seed("commitment service").unwrap();

        Signed::new(
            CancellationProofMsg {
                offer_id: OrderId::new(7),
                cancellation_proof: dummy_commitment_proof(),
            },
            &keypair,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn order_message() -> OrderMessage {
        OrderMessage {
            ask_token: token(0xaa),
            ask_amount: 1,
            bid_token: token(0xbb),
            bid_amount: 100,
            order_id: OrderId::new(7),
            timeout: Timestamp::new(1_700_000_000_000),
        }
    }

    fn roundtrip(message: Message) {
        let opened = Envelope::open(&Envelope::seal(&message)).unwrap();

        assert_eq!(opened, message);
    }

    #[test]
    fn order_message_roundtrips() {
        roundtrip(Message::Order(order_message()));
    }

    #[test]
    fn commitment_roundtrips_and_recovers_sender() {
        let keypair = Keypair::from_seed("maker").unwrap();
        let commitment = Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(7),
                order_hash: order_message().hash(),
                timeout: Timestamp::new(1_700_000_060_000),
                amount: 1,
            },
            &keypair,
        );

        assert_eq!(commitment.sender().unwrap(), keypair.address());
        roundtrip(Message::Commitment(commitment));
    }

    #[test]
    fn hash_is_stable_across_roundtrip() {
        let keypair = Keypair::from_seed("maker").unwrap();
        let commitment = Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(9),
                order_hash: [3u8; 32],
                timeout: Timestamp::new(10),
                amount: 42,
            },
            &keypair,
        );

        let sealed = Envelope::seal(&Message::Commitment(commitment.clone()));
        let reopened = match Envelope::open(&sealed).unwrap() {
            Message::Commitment(c) => c,
            other => panic!("unexpected message {other}"),
        };

        assert_eq!(
            reopened.hash_without_signature(),
            commitment.hash_without_signature()
        );
        assert_eq!(reopened.sender().unwrap(), keypair.address());
    }

    #[test]
    fn proven_order_roundtrips_with_nested_proof() {
        let maker = Keypair::from_seed("maker").unwrap();
        let service = Keypair::from_seed("service").unwrap();
        let secret = Secret::random();

        let proof = Signed::new(
            CommitmentProofMsg {
                commitment_sig: maker.sign(keccak256(b"commitment")),
                secret_hash: secret.hash(),
                secret,
                offer_id: OrderId::new(7),
            },
            &service,
        );
        let proven = Signed::new(
            ProvenOrderMsg {
                order: order_message(),
                proof: proof.clone(),
            },
            &maker,
        );

        assert_eq!(proven.sender().unwrap(), maker.address());
        assert_eq!(proven.payload.proof.sender().unwrap(), service.address());
        roundtrip(Message::ProvenOrder(proven));
    }

    #[test]
    fn proven_commitment_roundtrips() {
        let taker = Keypair::from_seed("taker").unwrap();
        let service = Keypair::from_seed("service").unwrap();
        let secret = Secret::random();

        let commitment = Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(7),
                order_hash: order_message().hash(),
                timeout: Timestamp::new(1_700_000_060_000),
                amount: 1,
            },
            &taker,
        );
        let proof = Signed::new(
            CommitmentProofMsg {
                commitment_sig: commitment.signature,
                secret_hash: secret.hash(),
                secret,
                offer_id: OrderId::new(7),
            },
            &service,
        );

        roundtrip(Message::ProvenCommitment(Signed::new(
            ProvenCommitmentMsg { commitment, proof },
            &taker,
        )));
    }

    #[test]
    fn remaining_message_types_roundtrip() {
        let service = Keypair::from_seed("service").unwrap();

        roundtrip(Message::ServiceAdvertisement(Signed::new(
            ServiceAdvertisementMsg {
                address: service.address(),
                commitment_token: token(0xfe),
                fee_rate: 42_949_672,
            },
            &service,
        )));
        roundtrip(Message::SwapExecution(Signed::new(
            SwapExecutionMsg {
                offer_id: OrderId::new(7),
                timestamp: Timestamp::new(1_700_000_000_123),
            },
            &service,
        )));
        roundtrip(Message::SwapCompleted(Signed::new(
            SwapCompletedMsg {
                offer_id: OrderId::new(7),
                timestamp: Timestamp::new(1_700_000_000_456),
            },
            &service,
        )));
        roundtrip(Message::OfferTaken(Signed::new(
            OfferTakenMsg {
                offer_id: OrderId::new(7),
            },
            &service,
        )));
        roundtrip(Message::Cancellation(Signed::new(
            CancellationMsg {
                offer_id: OrderId::new(7),
            },
            &service,
        )));
        roundtrip(Message::CancellationProof(Signed::new(
            CancellationProofMsg {
                offer_id: OrderId::new(7),
                cancellation_proof: test_support::dummy_commitment_proof(),
            },
            &service,
        )));
    }

    #[test]
    fn tampering_with_the_payload_changes_the_recovered_sender() {
        let keypair = Keypair::from_seed("maker").unwrap();
        let mut commitment = Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(7),
                order_hash: [1u8; 32],
                timeout: Timestamp::new(10),
                amount: 1,
            },
            &keypair,
        );

        commitment.payload.amount = 1_000;

        assert_ne!(commitment.sender().unwrap(), keypair.address());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let sealed = Envelope::seal(&Message::Order(order_message()));
        let bumped = sealed.replace("\"version\":1", "\"version\":2");

        assert!(matches!(
            Envelope::open(&bumped),
            Err(Error::VersionMismatch(2))
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let sealed = Envelope::seal(&Message::Order(order_message()));
        let renamed = sealed.replace("\"msg\":\"offer\"", "\"msg\":\"gossip\"");

        assert!(matches!(Envelope::open(&renamed), Err(Error::UnknownTag(_))));
    }

    #[test]
    fn garbage_data_is_rejected() {
        assert!(Envelope::open("not json at all").is_err());

        let sealed = Envelope::seal(&Message::Order(order_message()));
        let envelope: EnvelopeJson = serde_json::from_str(&sealed).unwrap();
        let corrupted = serde_json::to_string(&EnvelopeJson {
            version: envelope.version,
            msg: envelope.msg,
            data: BASE64.encode(b"\x01\x02\x03"),
        })
        .unwrap();

        assert!(Envelope::open(&corrupted).is_err());
    }

    #[test]
    fn cmdid_mismatch_is_rejected() {
        // A commitment body announced under the cancellation tag decodes to
        // the wrong shape or the wrong cmdid, never to a message.
        let keypair = Keypair::from_seed("maker").unwrap();
        let commitment = Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(7),
                order_hash: [1u8; 32],
                timeout: Timestamp::new(10),
                amount: 1,
            },
            &keypair,
        );
        let sealed = Envelope::seal(&Message::Commitment(commitment));
        let relabeled = sealed.replace("\"msg\":\"commitment\"", "\"msg\":\"cancellation\"");

        assert!(Envelope::open(&relabeled).is_err());
    }
}
