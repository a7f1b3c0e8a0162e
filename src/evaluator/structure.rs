use crate::config::{StructurePoints, MIN_WEEKLY_BARS};
use crate::error::EvalError;
use crate::indicators::{ema, max_of, mean, nth_back, pct_change, sma, true_ranges};
use crate::types::{PriceSeries, RecoveryStructure, StackTier, StructureKind};

const BOUNCE_BAND: (f64, f64) = (-5.0, 2.0);
const EMA_SLOPE_BARS: usize = 8;
const UPTREND_BARS: usize = 12;
const PULLBACK_WINDOW: (usize, usize) = (4, 16);
const PULLBACK_MIN_PCT: f64 = 10.0;
const PULLBACK_NEAR_MA_PCT: f64 = 8.0;
const ATR_CONTRACTION: f64 = 0.85;

/// The four stack conditions in order, plus how many hold.
#[derive(Debug, Clone, Copy)]
struct Stack {
    sma50_over_sma200: bool,
    ema10_over_ema20: bool,
    ema20_over_sma50: bool,
    close_over_ema10: bool,
}

impl Stack {
    fn count(&self) -> u8 {
        [
            self.sma50_over_sma200,
            self.ema10_over_ema20,
            self.ema20_over_sma50,
            self.close_over_ema10,
        ]
        .iter()
        .filter(|&&c| c)
        .count() as u8
    }
}

/// Classify the post-bottom recovery structure of a weekly series.
///
/// Priority: full MA stack (terminal), partial stack, EMA bounce, first pullback.
/// A partial stack keeps its points; bounce and pullback are still evaluated
/// and only extend the label.
pub fn classify_structure(
    series: &PriceSeries,
    points: &StructurePoints,
) -> Result<RecoveryStructure, EvalError> {
    let n = series.len();
    if n < MIN_WEEKLY_BARS {
        return Err(EvalError::InsufficientHistory { have: n, need: MIN_WEEKLY_BARS });
    }

    let closes = series.closes();
    let close = closes[n - 1];
    let ema10_series = ema(&closes, 10);
    let ema20_series = ema(&closes, 20);
    let ema10 = ema10_series[n - 1];
    let ema20 = ema20_series[n - 1];
    let sma50 = sma(&closes, 50.min(n - 1))[n - 1].unwrap_or(close);
    let sma200 = sma(&closes, 200.min(n - 1))[n - 1].unwrap_or(close);

    let stack = Stack {
        sma50_over_sma200: sma50 > sma200,
        ema10_over_ema20: ema10 > ema20,
        ema20_over_sma50: ema20 > sma50,
        close_over_ema10: close > ema10,
    };
    let stack_conditions = stack.count();

    let mut out = RecoveryStructure {
        kind: StructureKind::None,
        stack_tier: None,
        points: 0,
        label: "No structure".to_string(),
        ema10,
        ema20,
        sma50,
        sma200,
        stack_conditions,
        bounce_ema: false,
        first_pullback: false,
        local_high_pct: 0.0,
        atr_contracting: false,
    };

    if stack_conditions == 4 {
        out.kind = StructureKind::MaStack;
        out.stack_tier = Some(StackTier::Full);
        out.points = points.full_stack;
        out.label = "MA Stack".to_string();
        return Ok(out);
    }
    if stack_conditions == 3 {
        out.kind = StructureKind::MaStack;
        out.stack_tier = Some(StackTier::Partial);
        out.points = points.partial_stack;
        out.label = "Partial Stack".to_string();
    }

    // --- EMA bounce ---

    let touching = |line: &[f64]| {
        let last = line[n - 1];
        let slope = nth_back(line, EMA_SLOPE_BARS).map_or(0.0, |then| last - then);
        let dist = pct_change(last, close).unwrap_or(f64::NAN);
        (BOUNCE_BAND.0..=BOUNCE_BAND.1).contains(&dist) && slope > 0.0
    };
    let reference = nth_back(&closes, UPTREND_BARS).unwrap_or(closes[0]);
    out.bounce_ema =
        (touching(&ema10_series) || touching(&ema20_series)) && close > reference;

    // --- First pullback ---

    let (near, far) = PULLBACK_WINDOW;
    let window = &closes[n - far.min(n - 1)..n + 1 - near];
    let local_high = max_of(window).unwrap_or(close);
    out.local_high_pct = pct_change(close, local_high).unwrap_or(0.0);

    let near_ma = [ema20, sma50]
        .iter()
        .any(|&ma| pct_change(ma, close).is_some_and(|d| d.abs() <= PULLBACK_NEAR_MA_PCT));
    out.atr_contracting = atr_contracting(series);
    out.first_pullback = out.local_high_pct >= PULLBACK_MIN_PCT && near_ma;

    // Partial stack keeps its points and kind.
    if out.kind == StructureKind::MaStack {
        if out.bounce_ema {
            out.label.push_str(" + EMA Bounce");
        } else if out.first_pullback {
            out.label.push_str(" + First Pullback");
        }
        return Ok(out);
    }

    if out.bounce_ema {
        out.kind = StructureKind::BounceEma;
        out.points = points.ema_bounce;
        out.label = "EMA Bounce".to_string();
    } else if out.first_pullback {
        out.kind = StructureKind::FirstPullback;
        if out.atr_contracting {
            out.points = points.first_pullback;
            out.label = "First Pullback + Compression".to_string();
        } else {
            out.points = points.first_pullback_loose;
            out.label = "First Pullback".to_string();
        }
    }
    Ok(out)
}

/// Mean true range of the last 4 bars below 85% of the mean over the 8 bars before.
fn atr_contracting(series: &PriceSeries) -> bool {
    let tr = true_ranges(series.bars());
    let n = tr.len();
    if n < 12 {
        return false;
    }
    match (mean(&tr[n - 4..]), mean(&tr[n - 12..n - 4])) {
        (Some(recent), Some(prior)) => recent < prior * ATR_CONTRACTION,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::test_support::{series_from, weekly_bars};

    fn classify(closes: &[f64]) -> RecoveryStructure {
        let vols = vec![1000.0; closes.len()];
        classify_structure(&series_from(weekly_bars(closes, &vols)), &StructurePoints::default())
            .unwrap()
    }

    fn uptrend() -> Vec<f64> {
        (0..120).map(|i| 10.0 + 0.5 * i as f64).collect()
    }

    /// 150 bars falling from 100 to 40.4, then 40 bars rising 0.5 a bar to 60.
    fn bottom_then_recovery(rise_bars: usize) -> Vec<f64> {
        let mut closes: Vec<f64> = (0..150).map(|j| 100.0 - 0.4 * j as f64).collect();
        closes.extend((1..=rise_bars).map(|k| 40.0 + 0.5 * k as f64));
        closes
    }

    #[test]
    fn short_series_is_insufficient() {
        let closes = vec![10.0; 51];
        let err = classify_structure(
            &series_from(weekly_bars(&closes, &closes)),
            &StructurePoints::default(),
        )
        .unwrap_err();
        assert_eq!(err, EvalError::InsufficientHistory { have: 51, need: 52 });
    }

    #[test]
    fn steady_uptrend_is_a_full_stack() {
        let s = classify(&uptrend());
        assert_eq!(s.stack_conditions, 4);
        assert_eq!(s.kind, StructureKind::MaStack);
        assert_eq!(s.stack_tier, Some(StackTier::Full));
        assert_eq!(s.points, 15);
        assert_eq!(s.label, "MA Stack");
    }

    #[test]
    fn close_under_ema10_drops_to_partial_stack() {
        let mut closes = uptrend();
        *closes.last_mut().unwrap() -= 5.0;
        let s = classify(&closes);
        assert_eq!(s.stack_conditions, 3);
        assert_eq!(s.kind, StructureKind::MaStack);
        assert_eq!(s.stack_tier, Some(StackTier::Partial));
        assert_eq!(s.points, 8);
        assert!(s.label.starts_with("Partial Stack"));
        assert!(s.points < StructurePoints::default().full_stack);
    }

    #[test]
    fn dip_to_rising_ema_is_a_bounce() {
        let mut closes = bottom_then_recovery(30);
        closes.push(52.0);
        let s = classify(&closes);
        assert!(s.stack_conditions < 3);
        assert_eq!(s.kind, StructureKind::BounceEma);
        assert_eq!(s.points, 10);
        assert!(s.bounce_ema);
    }

    #[test]
    fn pullback_from_local_high_without_compression() {
        let mut closes = bottom_then_recovery(40);
        closes.extend((1..=6).map(|k| 60.0 - 1.5 * k as f64));
        let s = classify(&closes);
        assert!(!s.bounce_ema);
        assert!(s.local_high_pct >= 10.0);
        assert_eq!(s.kind, StructureKind::FirstPullback);
        assert!(!s.atr_contracting);
        assert_eq!(s.points, 7);
        assert_eq!(s.label, "First Pullback");
    }

    #[test]
    fn downtrend_has_no_structure() {
        let closes: Vec<f64> = (0..120).map(|j| 100.0 - 0.5 * j as f64).collect();
        let s = classify(&closes);
        assert_eq!(s.kind, StructureKind::None);
        assert_eq!(s.points, 0);
        assert_eq!(s.stack_tier, None);
    }
}
