use crate::types::{
    BaseSubtype, DailyMetrics, ExhaustionStage, RecoveryStructure, SetupMetrics, SlopeGrade,
    StructureKind,
};

const MAX_TAGS: usize = 3;
const DEEP_CORRECTION_PCT: f64 = 70.0;

/// Short human-readable tag line for a result, most important tags first.
pub fn signal_summary(
    setup: &SetupMetrics,
    daily: Option<&DailyMetrics>,
    structure: &RecoveryStructure,
) -> String {
    let mut tags: Vec<String> = Vec::new();

    match setup {
        SetupMetrics::Retest(w) => {
            if w.undercut_reclaim {
                tags.push("U&R".into());
            }
            if w.slope_grade == SlopeGrade::Rising {
                tags.push("SMA ↑".into());
            }
            match structure.kind {
                StructureKind::MaStack => tags.push("MA stack".into()),
                StructureKind::BounceEma => tags.push("EMA bounce".into()),
                StructureKind::FirstPullback => tags.push("1st pullback".into()),
                StructureKind::None => {}
            }
            if w.multiyear_vol_high {
                tags.push("3yr vol".into());
            } else if w.pass_volume_surge {
                tags.push("Vol surge".into());
            }
            if w.correction_pct >= DEEP_CORRECTION_PCT {
                tags.push(format!("Corr {:.0}%", w.correction_pct));
            }
            if w.resistance_flip {
                tags.push("R→S flip".into());
            }
        }
        SetupMetrics::BaseBreakout(b) => {
            tags.push(
                match b.subtype {
                    BaseSubtype::Growth => "Growth base",
                    BaseSubtype::Commodity => "Commodity base",
                }
                .into(),
            );
            match daily.map(|d| d.exhaustion.stage) {
                Some(ExhaustionStage::Breakout) => tags.push("⚡ Breakout".into()),
                Some(ExhaustionStage::Basing) => tags.push("⚡ Basing".into()),
                Some(ExhaustionStage::MaReclaim) => tags.push("⚡ MA reclaim".into()),
                _ => {}
            }
            if b.pass_volume_surge {
                tags.push("Vol surge".into());
            }
        }
    }

    if tags.is_empty() {
        return "Setup forming".to_string();
    }
    tags.truncate(MAX_TAGS);
    tags.join(" · ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::fixtures;
    use crate::types::{Exhaustion, StackTier};

    fn structure(kind: StructureKind) -> RecoveryStructure {
        RecoveryStructure {
            kind,
            stack_tier: (kind == StructureKind::MaStack).then_some(StackTier::Full),
            ..RecoveryStructure::not_applicable()
        }
    }

    #[test]
    fn nothing_notable_is_setup_forming() {
        let setup = SetupMetrics::Retest(fixtures::weekly());
        assert_eq!(signal_summary(&setup, None, &structure(StructureKind::None)), "Setup forming");
    }

    #[test]
    fn retest_tags_in_order_capped_at_three() {
        let mut w = fixtures::weekly();
        w.undercut_reclaim = true;
        w.undercut_weeks_ago = Some(1);
        w.slope_grade = SlopeGrade::Rising;
        w.multiyear_vol_high = true;
        w.correction_pct = 75.0;
        let setup = SetupMetrics::Retest(w);
        assert_eq!(
            signal_summary(&setup, None, &structure(StructureKind::MaStack)),
            "U&R · SMA ↑ · MA stack"
        );
    }

    #[test]
    fn deep_correction_and_volume_tags() {
        let mut w = fixtures::weekly();
        w.pass_volume_surge = true;
        w.correction_pct = 72.4;
        let setup = SetupMetrics::Retest(w);
        assert_eq!(
            signal_summary(&setup, None, &structure(StructureKind::BounceEma)),
            "EMA bounce · Vol surge · Corr 72%"
        );
    }

    #[test]
    fn base_tags_include_exhaustion_stage() {
        let setup = SetupMetrics::BaseBreakout(fixtures::base(BaseSubtype::Growth));
        let daily = DailyMetrics {
            exhaustion: Exhaustion {
                dot_fired: true,
                dot_days_ago: Some(3),
                dot_atr_mult: Some(-11.0),
                stage: ExhaustionStage::Basing,
                points: 10,
            },
            ..fixtures::daily()
        };
        assert_eq!(
            signal_summary(&setup, Some(&daily), &RecoveryStructure::not_applicable()),
            "Growth base · ⚡ Basing · Vol surge"
        );
    }
}
