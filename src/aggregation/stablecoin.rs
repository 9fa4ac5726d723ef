//! USD-normalized stablecoin-tier resolution (spec §4.2 step 4): the one
//! server-side coherence check the protocol makes, everything else being the
//! client's responsibility by design.

use rust_decimal::Decimal;

use crate::model::Sample;

/// Conventional average-based median — used for every median computation
/// *except* the final value of a direct-median domain or a hybrid domain,
/// which instead use the lower-neighbor tie-break in [`super::median_direct`].
pub fn median(values: &mut [Decimal]) -> Decimal {
    values.sort();
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / Decimal::TWO
    }
}

pub struct StablecoinTierOutcome {
    pub merged: Vec<Sample>,
    pub stablecoin_tier_dropped: bool,
}

/// Separately medians the USD tier and the stablecoin tier, obtains the
/// stablecoin/USD reference rate as the median of two declared venues, and
/// either drops the stablecoin tier (divergence exceeds tolerance) or rebases
/// and merges it into the USD tier.
pub fn resolve_stablecoin_tier(
    usd_samples: &[Sample],
    stablecoin_samples: &[Sample],
    rate_samples: &[Sample],
    divergence_tolerance: Decimal,
) -> StablecoinTierOutcome {
    if stablecoin_samples.is_empty() || rate_samples.is_empty() || usd_samples.is_empty() {
        return StablecoinTierOutcome {
            merged: usd_samples.to_vec(),
            stablecoin_tier_dropped: true,
        };
    }

    let mut usd_values: Vec<Decimal> = usd_samples.iter().map(|s| s.value).collect();
    let median_usd = median(&mut usd_values);

    let mut stablecoin_values: Vec<Decimal> = stablecoin_samples.iter().map(|s| s.value).collect();
    let median_stablecoin = median(&mut stablecoin_values);

    let mut rate_values: Vec<Decimal> = rate_samples.iter().map(|s| s.value).collect();
    let rate = median(&mut rate_values);

    let divergence = (median_usd - median_stablecoin * rate).abs() / median_usd;

    if divergence > divergence_tolerance {
        StablecoinTierOutcome {
            merged: usd_samples.to_vec(),
            stablecoin_tier_dropped: true,
        }
    } else {
        let rebased = stablecoin_samples.iter().map(|s| Sample {
            source_id: s.source_id.clone(),
            value: s.value * rate,
            volume: s.volume,
            captured_at: s.captured_at,
        });
        let merged = usd_samples.iter().cloned().chain(rebased).collect();
        StablecoinTierOutcome {
            merged,
            stablecoin_tier_dropped: false,
        }
    }
}
