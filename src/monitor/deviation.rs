//! Deviation predicate

use rust_decimal::Decimal;

/// Whether `next` deviates from `cur` by at least `threshold_pct` percent.
///
/// Arithmetic is exact decimal so the threshold boundary is precise; a
/// deviation exactly equal to the threshold counts as outside. A current
/// answer of zero always counts as outside: any movement away from an
/// unbootstrapped price is significant.
pub fn outside_deviation(cur: Decimal, next: Decimal, threshold_pct: Decimal) -> bool {
    if cur.is_zero() {
        log::info!("current price is 0, deviation automatically met");
        return true;
    }

    let percentage = (cur - next).abs() / cur * Decimal::from(100);
    if percentage < threshold_pct {
        log::debug!(
            "deviation threshold not met: difference {} < threshold {} (current {}, next {})",
            percentage,
            threshold_pct,
            cur,
            next
        );
        return false;
    }

    log::info!(
        "deviation threshold met: difference {} >= threshold {} (current {}, next {})",
        percentage,
        threshold_pct,
        cur,
        next
    );
    true
}
