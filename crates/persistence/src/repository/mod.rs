//! Repository implementations for database operations

pub mod backtests;
pub mod baskets;
pub mod candles;
pub mod watchlist;

pub use backtests::*;
pub use baskets::*;
pub use candles::*;
pub use watchlist::*;
