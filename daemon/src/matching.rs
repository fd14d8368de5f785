use crate::model::{OrderKind, Price, TokenAmount};
use crate::order_book::{OrderBook, OrderBookEntry};
use itertools::Itertools;

/// An entry expired between being selected by the matching engine and being
/// taken; the take is aborted and the remainder stays for the next round.
#[derive(thiserror::Error, Debug)]
#[error("Order {0} timed out before it could be taken")]
pub struct OfferTimedOut(pub crate::model::OrderId);

/// Limit matching: collect the opposite-side entries whose price is not
/// adverse to the incoming order, then fill largest-first.
///
/// Largest-first greedy keeps the number of counterparties small at the cost
/// of price-time priority.
pub fn match_limit(
    book: &OrderBook,
    kind: OrderKind,
    price: Price,
    amount: TokenAmount,
) -> (Vec<OrderBookEntry>, TokenAmount) {
    let candidates = book
        .view(kind.opposite())
        .iter()
        .filter(|entry| match kind {
            OrderKind::Buy => entry.price <= price,
            OrderKind::Sell => entry.price >= price,
        })
        .sorted_by(|a, b| b.base_amount.cmp(&a.base_amount));

    let mut amount_left = amount;
    let mut taken = Vec::new();

    for entry in candidates {
        if entry.base_amount <= amount_left {
            amount_left -= entry.base_amount;
            taken.push(entry.clone());
        }
    }

    (taken, amount_left)
}

/// Re-checks an entry right before the take flow starts.
pub fn ensure_takeable(entry: &OrderBookEntry) -> Result<(), OfferTimedOut> {
    if entry.timed_out() {
        return Err(OfferTimedOut(entry.order_id()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::model::OrderId;
    use crate::order_book::tests::entry;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn sell_book(maker: &Keypair, amounts: &[(u32, u128, u128)]) -> OrderBook {
        let mut book = OrderBook::default();
        for (id, base, quote) in amounts {
            book.insert(entry(maker, *id, OrderKind::Sell, *base, *quote));
        }

        book
    }

    #[test]
    fn buy_takes_largest_sells_first_and_returns_the_rest() {
        let maker = Keypair::from_seed("maker").unwrap();
        // 6000, 5000 and 4000 base units, all at 0.01 quote per base.
        let book = sell_book(&maker, &[(1, 6000, 60), (2, 5000, 50), (3, 4000, 40)]);

        let (taken, left) = match_limit(
            &book,
            OrderKind::Buy,
            Price::new(dec!(0.01)).unwrap(),
            12_000,
        );

        let amounts: Vec<_> = taken.iter().map(|e| e.base_amount).collect();
        assert_eq!(amounts, vec![6000, 5000]);
        assert_eq!(left, 1000);
    }

    #[test]
    fn matching_conserves_the_order_amount() {
        let maker = Keypair::from_seed("maker").unwrap();
        let book = sell_book(&maker, &[(1, 7000, 70), (2, 3000, 30), (3, 2500, 25)]);
        let amount = 10_000;

        let (taken, left) = match_limit(
            &book,
            OrderKind::Buy,
            Price::new(dec!(0.02)).unwrap(),
            amount,
        );

        let taken_sum: u128 = taken.iter().map(|e| e.base_amount).sum();
        assert_eq!(taken_sum + left, amount);
    }

    #[test]
    fn buy_ignores_sells_above_its_price() {
        let maker = Keypair::from_seed("maker").unwrap();
        // 0.01 and 0.03 quote per base.
        let book = sell_book(&maker, &[(1, 100, 1), (2, 100, 3)]);

        let (taken, left) = match_limit(
            &book,
            OrderKind::Buy,
            Price::new(dec!(0.02)).unwrap(),
            200,
        );

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].order_id(), OrderId::new(1));
        assert_eq!(left, 100);
    }

    #[test]
    fn sell_takes_buys_at_or_above_its_price() {
        let maker = Keypair::from_seed("maker").unwrap();
        let mut book = OrderBook::default();
        book.insert(entry(&maker, 1, OrderKind::Buy, 100, 1)); // 0.01
        book.insert(entry(&maker, 2, OrderKind::Buy, 100, 3)); // 0.03

        let (taken, left) = match_limit(
            &book,
            OrderKind::Sell,
            Price::new(dec!(0.02)).unwrap(),
            100,
        );

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].order_id(), OrderId::new(2));
        assert_eq!(left, 0);
    }

    #[test]
    fn entries_larger_than_the_remainder_are_skipped() {
        let maker = Keypair::from_seed("maker").unwrap();
        let book = sell_book(&maker, &[(1, 80, 1), (2, 70, 1)]);

        let (taken, left) = match_limit(
            &book,
            OrderKind::Buy,
            Price::new(dec!(0.02)).unwrap(),
            100,
        );

        // The 80 fills first; 70 does not fit into the remaining 20.
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].base_amount, 80);
        assert_eq!(left, 20);
    }
}
