pub mod balance_service;
pub mod order_service;
pub mod user_service;

pub use balance_service::{BalanceService, BalanceServiceError};
pub use order_service::{
    AccrualOutcome, AccrualUpdate, OrderService, OrderServiceError,
};
pub use user_service::{UserService, UserServiceError};

use rand::Rng;

/// Spreads `value` by a random factor in `[1 - spread, 1 + spread]`.
pub(crate) fn jitter(value: f64, spread: f64) -> f64 {
    let factor = 1.0 - spread + rand::thread_rng().gen_range(0.0..=(2.0 * spread));
    value * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_spread() {
        for _ in 0..1000 {
            let value = jitter(10.0, 0.25);
            assert!((7.5..=12.5).contains(&value), "out of range: {value}");
        }
    }

    #[test]
    fn jitter_zero_spread_is_identity() {
        assert_eq!(jitter(4.0, 0.0), 4.0);
    }
}
