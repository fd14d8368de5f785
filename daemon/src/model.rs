use crate::keypair::{keccak256, Address};
use rand::{thread_rng, Rng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod order;

/// Token quantities in the token's smallest unit.
pub type TokenAmount = u128;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Price of zero is not allowed")]
    ZeroPrice,
    #[error("Negative price is not allowed")]
    NegativePrice,
    #[error("Base and quote token must differ")]
    DegenerateMarket,
    #[error("Token pair does not contain {0}")]
    UnknownToken(Address),
    #[error("Amount does not fit the price scale")]
    AmountOverflow,
    #[error("Fee rate must be within [0, 1)")]
    FeeRateOutOfRange,
}

/// Random 32-bit order identifier, chosen by the node that creates the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(u32);

impl OrderId {
    pub fn random() -> Self {
        Self(thread_rng().gen())
    }

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Random 32-byte trade identifier, issued by the commitment service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TradeId([u8; 32]);

impl TradeId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        thread_rng().fill(&mut bytes);

        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Quote-per-base price of an order. Total order so it can key the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: Decimal) -> Result<Self, Error> {
        if value == Decimal::ZERO {
            return Err(Error::ZeroPrice);
        }

        if value < Decimal::ZERO {
            return Err(Error::NegativePrice);
        }

        Ok(Self(value))
    }

    /// The price implied by an absolute (base, quote) amount pair.
    pub fn from_amounts(base_amount: TokenAmount, quote_amount: TokenAmount) -> Result<Self, Error> {
        let base = Decimal::from_u128(base_amount).ok_or(Error::AmountOverflow)?;
        let quote = Decimal::from_u128(quote_amount).ok_or(Error::AmountOverflow)?;

        if base.is_zero() {
            return Err(Error::ZeroPrice);
        }

        Self::new(quote / base)
    }

    /// The quote amount corresponding to `base_amount` at this price,
    /// truncated to whole token units.
    pub fn quote_amount(&self, base_amount: TokenAmount) -> Result<TokenAmount, Error> {
        let base = Decimal::from_u128(base_amount).ok_or(Error::AmountOverflow)?;

        (base * self.0).floor().to_u128().ok_or(Error::AmountOverflow)
    }

    pub fn into_decimal(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl str::FromStr for Price {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dec = Decimal::from_str_exact(s)?;

        Ok(Price::new(dec)?)
    }
}

/// UTC milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis: i64 = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time not to go backwards")
            .as_millis()
            .try_into()
            .expect("milliseconds of system time to fit into i64");

        Self(millis)
    }

    pub fn in_the_future(lifetime: Duration) -> Self {
        Self(Self::now().0 + lifetime.as_millis() as i64)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn has_passed(&self) -> bool {
        *self <= Self::now()
    }

    /// Time left until this deadline, zero if it already passed.
    pub fn until(&self) -> Duration {
        let remaining = self.0 - Self::now().0;

        Duration::from_millis(remaining.max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Side of an order relative to the market's base token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Buy,
    Sell,
}

impl OrderKind {
    pub fn opposite(&self) -> OrderKind {
        match self {
            OrderKind::Buy => OrderKind::Sell,
            OrderKind::Sell => OrderKind::Buy,
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Buy => write!(f, "buy"),
            OrderKind::Sell => write!(f, "sell"),
        }
    }
}

/// Which side of a pairing this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Maker,
    Taker,
}

/// The market traded by a node: a base/quote token pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    base_token: Address,
    quote_token: Address,
    base_decimals: u8,
    quote_decimals: u8,
}

impl TokenPair {
    pub fn new(
        base_token: Address,
        base_decimals: u8,
        quote_token: Address,
        quote_decimals: u8,
    ) -> Result<Self, Error> {
        if base_token == quote_token {
            return Err(Error::DegenerateMarket);
        }

        Ok(Self {
            base_token,
            quote_token,
            base_decimals,
            quote_decimals,
        })
    }

    pub fn base_token(&self) -> Address {
        self.base_token
    }

    pub fn quote_token(&self) -> Address {
        self.quote_token
    }

    pub fn base_decimals(&self) -> u8 {
        self.base_decimals
    }

    pub fn quote_decimals(&self) -> u8 {
        self.quote_decimals
    }

    /// Classifies an (ask, bid) token orientation: asking for base against
    /// quote is a buy, the other way round a sell.
    pub fn kind_of(&self, ask_token: Address, bid_token: Address) -> Result<OrderKind, Error> {
        if ask_token == self.base_token && bid_token == self.quote_token {
            Ok(OrderKind::Buy)
        } else if ask_token == self.quote_token && bid_token == self.base_token {
            Ok(OrderKind::Sell)
        } else if ask_token != self.base_token && ask_token != self.quote_token {
            Err(Error::UnknownToken(ask_token))
        } else {
            Err(Error::UnknownToken(bid_token))
        }
    }

    /// The token a party pays out in a trade, given its role and order side.
    pub fn outbound_token(&self, role: Role, kind: OrderKind) -> Address {
        match (role, kind) {
            (Role::Maker, OrderKind::Buy) | (Role::Taker, OrderKind::Sell) => self.quote_token,
            (Role::Maker, OrderKind::Sell) | (Role::Taker, OrderKind::Buy) => self.base_token,
        }
    }
}

/// Hash-lock preimage for the channel swap. The zero secret is reserved.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];

        loop {
            thread_rng().fill(&mut bytes);
            if bytes != [0u8; 32] {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}

/// Commitment-service fee as a fraction of 2^32, matching the wire encoding
/// of the service advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate(u32);

impl FeeRate {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn from_ratio(ratio: Decimal) -> Result<Self, Error> {
        if ratio < Decimal::ZERO || ratio >= Decimal::ONE {
            return Err(Error::FeeRateOutOfRange);
        }

        let raw = (ratio * Decimal::from(1u64 << 32))
            .to_u64()
            .ok_or(Error::FeeRateOutOfRange)?;

        Ok(Self(raw.min(u32::MAX as u64) as u32))
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// The fee deducted from `amount`, rounded half-up.
    pub fn fee(&self, amount: TokenAmount) -> TokenAmount {
        (amount * self.0 as u128 + (1u128 << 31)) >> 32
    }

    /// `amount` with the fee deducted.
    pub fn apply(&self, amount: TokenAmount) -> TokenAmount {
        amount - self.fee(amount)
    }
}

impl str::FromStr for FeeRate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ratio = Decimal::from_str_exact(s)?;

        Ok(FeeRate::from_ratio(ratio)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn token(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    #[test]
    fn token_pair_rejects_equal_tokens() {
        let result = TokenPair::new(token(1), 3, token(1), 18);

        assert!(matches!(result, Err(Error::DegenerateMarket)));
    }

    #[test]
    fn ask_for_base_is_a_buy() {
        let pair = TokenPair::new(token(1), 3, token(2), 18).unwrap();

        assert_eq!(pair.kind_of(token(1), token(2)).unwrap(), OrderKind::Buy);
        assert_eq!(pair.kind_of(token(2), token(1)).unwrap(), OrderKind::Sell);
        assert!(pair.kind_of(token(3), token(2)).is_err());
    }

    #[test]
    fn price_from_amounts_is_quote_per_base() {
        let price = Price::from_amounts(100, 1).unwrap();

        assert_eq!(price.into_decimal(), dec!(0.01));
        assert_eq!(price.quote_amount(100).unwrap(), 1);
    }

    #[test]
    fn outbound_token_follows_role_and_side() {
        let pair = TokenPair::new(token(1), 3, token(2), 18).unwrap();

        // A selling maker pays out base, its buying taker pays out quote.
        assert_eq!(pair.outbound_token(Role::Maker, OrderKind::Sell), token(1));
        assert_eq!(pair.outbound_token(Role::Taker, OrderKind::Buy), token(2));
        assert_eq!(pair.outbound_token(Role::Maker, OrderKind::Buy), token(2));
        assert_eq!(pair.outbound_token(Role::Taker, OrderKind::Sell), token(1));
    }

    #[test]
    fn one_percent_fee_on_round_amounts() {
        let rate = FeeRate::from_ratio(dec!(0.01)).unwrap();

        assert_eq!(rate.fee(10_000), 100);
        assert_eq!(rate.apply(10_000), 9_900);
    }

    #[test]
    fn zero_fee_rate_refunds_everything() {
        let rate = FeeRate::from_ratio(Decimal::ZERO).unwrap();

        assert_eq!(rate.apply(12_345), 12_345);
    }

    #[test]
    fn fee_rate_survives_wire_roundtrip() {
        let rate = FeeRate::from_ratio(dec!(0.01)).unwrap();

        assert_eq!(FeeRate::from_raw(rate.to_raw()), rate);
    }

    #[test]
    fn secret_hash_matches_keccak() {
        let secret = Secret::random();

        assert_eq!(secret.hash(), keccak256(secret.as_bytes()));
    }
}
