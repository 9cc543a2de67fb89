use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::{Exchange, ExchangeError};

/// Offsets above this are worth telling the operator about
pub const SIGNIFICANT_OFFSET_MS: i64 = 1000;

/// Difference between exchange time and local time, measured once at startup
///
/// Every signed request timestamp and every "is this candle closed" check
/// goes through this value instead of the raw local clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    offset_ms: i64,
}

impl ClockOffset {
    pub fn from_millis(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// Offset from a server reading taken at local time `local`
    pub fn between(server: DateTime<Utc>, local: DateTime<Utc>) -> Self {
        Self {
            offset_ms: (server - local).num_milliseconds(),
        }
    }

    /// Ask the exchange for its time, using the midpoint of the round trip
    pub async fn measure(exchange: &dyn Exchange) -> Result<Self, ExchangeError> {
        let before = Utc::now();
        let server = exchange.server_time().await?;
        let after = Utc::now();
        let local = before + (after - before) / 2;

        let offset = Self::between(server, local);
        if offset.is_significant() {
            warn!(
                "⚠️  Local clock differs from exchange by {} ms, applying offset",
                offset.offset_ms
            );
        } else {
            info!("🕒 Clock offset to exchange: {} ms", offset.offset_ms);
        }
        Ok(offset)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn is_significant(&self) -> bool {
        self.offset_ms.abs() > SIGNIFICANT_OFFSET_MS
    }

    /// Exchange-aligned version of a local instant
    pub fn apply(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local + Duration::milliseconds(self.offset_ms)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.apply(Utc::now())
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;

    #[test]
    fn test_offset_between() {
        let local = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let server = local + Duration::milliseconds(1500);

        let offset = ClockOffset::between(server, local);
        assert_eq!(offset.offset_ms(), 1500);
        assert!(offset.is_significant());
        assert_eq!(offset.apply(local), server);
    }

    #[test]
    fn test_small_offset_not_significant() {
        assert!(!ClockOffset::from_millis(-999).is_significant());
        assert!(ClockOffset::from_millis(-1001).is_significant());
        assert!(!ClockOffset::default().is_significant());
    }

    #[tokio::test]
    async fn test_measure_against_exchange() {
        let exchange = PaperExchange::new("USDT");
        exchange.set_server_offset_ms(5_000).await;

        let offset = ClockOffset::measure(&exchange).await.unwrap();
        assert!((offset.offset_ms() - 5_000).abs() < 200);
    }
}
