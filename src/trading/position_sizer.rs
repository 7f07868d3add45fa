//! Copy sizing and eligibility: how much to open on a receiver, under which
//! symbol, and whether to open at all this cycle.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{CopyStatus, Position, ReceiverCopy, SymbolInfo, TradeSide};

use super::ReceiverConfig;

/// Why a (record, receiver) pair gets no open this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("already copied")]
    AlreadyCopied,

    #[error("last attempt too recent, retry in {0}s")]
    RetryPending(i64),

    #[error("trade too old ({0} minutes)")]
    TooOld(i64),

    #[error("{0} trades disabled for this receiver")]
    SideDisabled(TradeSide),
}

/// Floor `volume` to the symbol's lot step, then clamp to its limits.
///
/// Anything that ends up below the minimum lot (including zero and
/// negative input) collapses to zero, meaning "do not open".
pub fn normalize_volume(info: &SymbolInfo, volume: Decimal) -> Decimal {
    if volume <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let stepped = if info.volume_step > Decimal::ZERO {
        (volume / info.volume_step).floor() * info.volume_step
    } else {
        volume
    };

    if stepped <= Decimal::ZERO || stepped < info.volume_min {
        return Decimal::ZERO;
    }
    stepped.min(info.volume_max).normalize()
}

/// Per-receiver copy rules.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    receiver: ReceiverConfig,
    retry_interval: Duration,
}

impl PositionSizer {
    pub fn new(receiver: ReceiverConfig, retry_interval: Duration) -> Self {
        Self {
            receiver,
            retry_interval,
        }
    }

    pub fn receiver(&self) -> &ReceiverConfig {
        &self.receiver
    }

    /// Decide whether `position` may be opened on this receiver at `now`.
    pub fn check_eligible(
        &self,
        copy: Option<&ReceiverCopy>,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Result<(), SkipReason> {
        if let Some(copy) = copy {
            match copy.status() {
                CopyStatus::Copied => return Err(SkipReason::AlreadyCopied),
                CopyStatus::Attempted if !copy.retry_due(now, self.retry_interval) => {
                    let elapsed = copy
                        .last_attempt_time()
                        .map_or(Duration::zero(), |last| now - last);
                    return Err(SkipReason::RetryPending(
                        (self.retry_interval - elapsed).num_seconds().max(0),
                    ));
                }
                _ => {}
            }
        }

        let age = position.age(now);
        if age > self.receiver.max_trade_age() {
            return Err(SkipReason::TooOld(age.num_minutes()));
        }

        if !self.receiver.allows(position.side) {
            return Err(SkipReason::SideDisabled(position.side));
        }

        Ok(())
    }

    /// Receiver-side symbol for a provider symbol.
    pub fn receiver_symbol<'a>(&'a self, provider_symbol: &'a str) -> &'a str {
        self.receiver.map_symbol(provider_symbol)
    }

    /// Provider volume scaled by the receiver multiplier and normalized to
    /// the receiver's symbol constraints.
    pub fn copy_volume(&self, info: &SymbolInfo, provider_volume: Decimal) -> Decimal {
        normalize_volume(info, provider_volume * self.receiver.volume_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::CopierConfig;
    use rust_decimal_macros::dec;

    fn symbol(min: Decimal, max: Decimal, step: Decimal) -> SymbolInfo {
        SymbolInfo {
            name: "EURUSD".to_string(),
            volume_min: min,
            volume_max: max,
            volume_step: step,
            digits: 5,
        }
    }

    fn sizer(extra: &str) -> PositionSizer {
        let raw = format!(
            r#"{{"provider": {{"account": 1, "password": "p"}},
                "receivers": [{{"account": 2, "password": "r" {}}}]}}"#,
            extra
        );
        let config = CopierConfig::from_json(&raw).unwrap();
        PositionSizer::new(config.receivers[0].clone(), Duration::seconds(30))
    }

    fn position(side: TradeSide, age_minutes: i64) -> Position {
        Position {
            ticket: 1001,
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(1.0),
            open_price: dec!(1.1),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            open_time: Utc::now() - Duration::minutes(age_minutes),
            profit: Decimal::ZERO,
            tag: 0,
            comment: String::new(),
        }
    }

    #[test]
    fn test_normalize_volume() {
        let info = symbol(dec!(0.01), dec!(10), dec!(0.01));

        assert_eq!(normalize_volume(&info, dec!(0.019)), dec!(0.01));
        assert_eq!(normalize_volume(&info, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(normalize_volume(&info, dec!(-1)), Decimal::ZERO);
        assert_eq!(normalize_volume(&info, dec!(0.005)), Decimal::ZERO);
        assert_eq!(normalize_volume(&info, dec!(25)), dec!(10));
        assert_eq!(normalize_volume(&info, dec!(0.29)), dec!(0.29));
    }

    #[test]
    fn test_normalize_coarse_step() {
        let info = symbol(dec!(0.1), dec!(50), dec!(0.1));
        assert_eq!(normalize_volume(&info, dec!(0.35)), dec!(0.3));
        assert_eq!(normalize_volume(&info, dec!(0.09)), Decimal::ZERO);
    }

    #[test]
    fn test_copy_volume_applies_multiplier() {
        let sizer = sizer(r#", "provider_lot_size_multiplied_by": 0.1"#);
        let info = symbol(dec!(0.01), dec!(100), dec!(0.01));

        assert_eq!(sizer.copy_volume(&info, dec!(1.0)), dec!(0.1));
        assert_eq!(sizer.copy_volume(&info, dec!(0.05)), Decimal::ZERO);
    }

    #[test]
    fn test_eligibility() {
        let sizer = sizer(r#", "copy_sell_trades": false, "max_trade_age_minutes": 5"#);
        let now = Utc::now();

        assert_eq!(sizer.check_eligible(None, &position(TradeSide::Buy, 1), now), Ok(()));
        assert_eq!(
            sizer.check_eligible(None, &position(TradeSide::Sell, 1), now),
            Err(SkipReason::SideDisabled(TradeSide::Sell))
        );
        assert!(matches!(
            sizer.check_eligible(None, &position(TradeSide::Buy, 6), now),
            Err(SkipReason::TooOld(_))
        ));

        let copied = ReceiverCopy::copied(9);
        assert_eq!(
            sizer.check_eligible(Some(&copied), &position(TradeSide::Buy, 1), now),
            Err(SkipReason::AlreadyCopied)
        );
    }

    #[test]
    fn test_retry_interval_gates_attempts() {
        let sizer = sizer("");
        let now = Utc::now();
        let mut copy = ReceiverCopy::default();
        copy.begin_attempt(now - Duration::seconds(10)).unwrap();

        assert!(matches!(
            sizer.check_eligible(Some(&copy), &position(TradeSide::Buy, 1), now),
            Err(SkipReason::RetryPending(_))
        ));
        assert_eq!(
            sizer.check_eligible(
                Some(&copy),
                &position(TradeSide::Buy, 1),
                now + Duration::seconds(25)
            ),
            Ok(())
        );
    }
}
