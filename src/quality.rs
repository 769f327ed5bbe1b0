//! Quality policy table: a pure mapping from clamped quality level to
//! `{min_member_months, max_age_hours}`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPolicy {
    pub min_member_months: i64,
    pub max_age_hours: i64,
}

pub fn quality_mapping(quality_level: i64) -> QualityPolicy {
    let q = quality_level.clamp(0, 100);
    if q >= 90 {
        QualityPolicy {
            min_member_months: 24,
            max_age_hours: 24,
        }
    } else if q >= 70 {
        QualityPolicy {
            min_member_months: 12,
            max_age_hours: 36,
        }
    } else if q >= 40 {
        QualityPolicy {
            min_member_months: 6,
            max_age_hours: 48,
        }
    } else {
        QualityPolicy {
            min_member_months: 0,
            max_age_hours: 48,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_match_table() {
        assert_eq!(
            quality_mapping(90),
            QualityPolicy {
                min_member_months: 24,
                max_age_hours: 24
            }
        );
        assert_eq!(
            quality_mapping(89),
            QualityPolicy {
                min_member_months: 12,
                max_age_hours: 36
            }
        );
        assert_eq!(
            quality_mapping(70),
            QualityPolicy {
                min_member_months: 12,
                max_age_hours: 36
            }
        );
        assert_eq!(
            quality_mapping(40),
            QualityPolicy {
                min_member_months: 6,
                max_age_hours: 48
            }
        );
        assert_eq!(
            quality_mapping(0),
            QualityPolicy {
                min_member_months: 0,
                max_age_hours: 48
            }
        );
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(quality_mapping(-5), quality_mapping(0));
        assert_eq!(quality_mapping(500), quality_mapping(100));
    }

    proptest::proptest! {
        #[test]
        fn monotonic_over_full_range(q in 0i64..=100) {
            let here = quality_mapping(q);
            let next = quality_mapping((q + 1).min(100));
            // non-increasing max_age_hours, non-decreasing min_member_months
            proptest::prop_assert!(next.max_age_hours <= here.max_age_hours);
            proptest::prop_assert!(next.min_member_months >= here.min_member_months);
        }
    }
}
