//! Venue-neutral order, book and position types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange-assigned order identifier.
pub type OrderId = i64;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that increases exposure in the direction of `signed_amount`.
    pub fn from_signed(signed_amount: Decimal) -> Self {
        if signed_amount >= Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Whether the order can still trade.
    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

/// New order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
}

impl NewOrder {
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            client_order_id: None,
        }
    }

    pub fn with_client_id(mut self, client_order_id: String) -> Self {
        self.client_order_id = Some(client_order_id);
        self
    }
}

/// Acknowledgement returned by `submit_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub symbol: String,
    pub status: OrderStatus,
}

/// Current state of an order as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// Cumulative filled quantity
    pub filled_quantity: Decimal,
    /// Volume-weighted fill price, zero when nothing filled
    pub avg_price: Decimal,
    pub status: OrderStatus,
}

impl OrderState {
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct BookTop {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
}

impl BookTop {
    pub fn mid(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }

    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    /// Passive price for a side: bid for buys, ask for sells.
    pub fn touch(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.bid_price,
            OrderSide::Sell => self.ask_price,
        }
    }

    /// Aggressive price for a side: ask for buys, bid for sells.
    pub fn far(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask_price,
            OrderSide::Sell => self.bid_price,
        }
    }
}

/// Open position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed base quantity (negative = short)
    pub quantity: Decimal,
    pub mark_price: Decimal,
}

impl Position {
    /// Signed USD notional.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.mark_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> BookTop {
        BookTop {
            symbol: "BTCUSDT".to_string(),
            bid_price: dec!(49990),
            bid_qty: dec!(2),
            ask_price: dec!(50010),
            ask_qty: dec!(3),
        }
    }

    #[test]
    fn test_book_touch_and_far() {
        let book = book();
        assert_eq!(book.touch(OrderSide::Buy), dec!(49990));
        assert_eq!(book.far(OrderSide::Buy), dec!(50010));
        assert_eq!(book.touch(OrderSide::Sell), dec!(50010));
        assert_eq!(book.far(OrderSide::Sell), dec!(49990));
        assert_eq!(book.mid(), dec!(50000));
        assert_eq!(book.spread(), dec!(20));
    }

    #[test]
    fn test_side_from_signed_amount() {
        assert_eq!(OrderSide::from_signed(dec!(-500)), OrderSide::Sell);
        assert_eq!(OrderSide::from_signed(dec!(500)), OrderSide::Buy);
        assert_eq!(OrderSide::Sell.sign(), dec!(-1));
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn test_position_notional_is_signed() {
        let short = Position {
            symbol: "ETHUSDT".to_string(),
            quantity: dec!(-2),
            mark_price: dec!(3000),
        };
        assert_eq!(short.notional(), dec!(-6000));
    }
}
