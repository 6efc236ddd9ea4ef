// crates/karman-numerics/src/limiters.rs

//! Slope-limiter scalar functions. The per-point reduction over edges lives
//! in the solver; these are the per-edge formulas.

use karman_core::Scalar;

/// Venkatakrishnan limiter value for one edge projection.
///
/// `dm` is the projected half-edge variation `0.5 grad . (x_j - x_i)`,
/// `dp` the admissible variation (`u_max - u` when `dm > 0`, `u_min - u`
/// otherwise), and `eps2 = (K L_ref)^3`.
#[inline]
#[must_use]
pub fn venkat(dp: Scalar, dm: Scalar, eps2: Scalar) -> Scalar {
    if dm == 0.0 {
        return 1.0;
    }
    ((dp * dp + 2.0 * dp * dm + eps2) / (dp * dp + 2.0 * dm * dm + dp * dm + eps2)).clamp(0.0, 1.0)
}

/// Minmod limiter value for one edge projection.
#[inline]
#[must_use]
pub fn minmod(dp: Scalar, dm: Scalar) -> Scalar {
    if dm == 0.0 {
        return 1.0;
    }
    (dp / dm).clamp(0.0, 1.0)
}

/// Van Albada edge form, applied directly to the two slopes of an edge.
#[inline]
#[must_use]
pub fn van_albada(da: Scalar, db: Scalar) -> Scalar {
    let denom = da * da + db * db;
    if denom <= Scalar::MIN_POSITIVE {
        return 0.0;
    }
    (da * db * (da + db) / denom).max(0.0) / (da + db).abs().max(Scalar::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venkat_is_one_on_smooth_data() {
        // dp == dm: smooth monotone field, limiter close to 1.
        let phi = venkat(1.0, 1.0, 1.0e-12);
        assert!(phi > 0.74 && phi <= 1.0, "phi = {phi}");
        // Large eps2 disables limiting entirely.
        assert!((venkat(0.0, 1.0, 1.0e6) - 1.0).abs() < 1.0e-5);
    }

    proptest::proptest! {
        /// Limiter values always land in [0, 1] for finite inputs.
        #[test]
        fn limiters_stay_in_unit_interval(
            dp in -1.0e6_f64..1.0e6,
            dm in -1.0e6_f64..1.0e6,
            eps2 in 0.0_f64..1.0e3,
        ) {
            let v = venkat(dp, dm, eps2);
            proptest::prop_assert!((0.0..=1.0).contains(&v), "venkat {}", v);
            let m = minmod(dp, dm);
            proptest::prop_assert!((0.0..=1.0).contains(&m), "minmod {}", m);
        }
    }

    #[test]
    fn limiters_clamp_overshoots() {
        // Projection far beyond the admissible variation.
        assert!(venkat(0.1, 10.0, 1.0e-12) < 0.1);
        assert!(minmod(0.1, 10.0) <= 0.011);
        // Opposite signs: fully limited.
        assert_eq!(minmod(-1.0, 1.0), 0.0);
    }
}
