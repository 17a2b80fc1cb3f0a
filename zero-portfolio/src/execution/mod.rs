//! Order and position primitives shared by portfolios and brokers.

mod order;
mod position;

pub use order::{OrderRequest, OrderSide, OrderStatus, OrderType, PendingOrder, TimeInForce};
pub use position::{combine, reduce, Position, FLAT_EPSILON};
