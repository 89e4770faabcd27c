//! IEEE-754 binary64 arithmetic in all 4 rounding modes.
//!
//! The VM's float instructions honour a rounding mode set by `CFROUND`. Rust has no access to the
//! FPU control word, so every operation is computed in round-to-nearest together with its exact
//! error and the result is then moved by one ulp where the selected mode requires it.

/// A rounding mode, in the order `CFROUND` selects them.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum RoundingMode {
    #[default]
    Nearest,
    Down,
    Up,
    TowardZero,
}

impl RoundingMode {
    /// Selects a mode from the low 2 bits of `x`.
    pub(crate) const fn from_u64(x: u64) -> Self {
        match x % 4 {
            0 => Self::Nearest,
            1 => Self::Down,
            2 => Self::Up,
            _ => Self::TowardZero,
        }
    }

    pub(crate) fn add(self, a: f64, b: f64) -> f64 {
        let sum = a + b;
        if !sum.is_finite() {
            return self.overflow(sum, a.is_finite() && b.is_finite());
        }

        if sum == 0.0 {
            // An exact zero from operands of opposite sign is -0 when rounding down.
            let both_positive_zero =
                a == 0.0 && b == 0.0 && a.is_sign_positive() && b.is_sign_positive();
            if self == Self::Down && !both_positive_zero {
                return -0.0;
            }
            return sum;
        }

        // TwoSum
        let b_virtual = sum - a;
        let a_virtual = sum - b_virtual;
        let err = (a - a_virtual) + (b - b_virtual);

        self.adjust(sum, err)
    }

    pub(crate) fn sub(self, a: f64, b: f64) -> f64 {
        self.add(a, -b)
    }

    pub(crate) fn mul(self, a: f64, b: f64) -> f64 {
        let product = a * b;
        if !product.is_finite() {
            return self.overflow(product, a.is_finite() && b.is_finite());
        }

        let err = a.mul_add(b, -product);
        self.adjust(product, err)
    }

    pub(crate) fn div(self, a: f64, b: f64) -> f64 {
        let quotient = a / b;
        if !quotient.is_finite() {
            return self.overflow(quotient, a.is_finite() && b.is_finite() && b != 0.0);
        }

        // the exact quotient minus `quotient` is remainder / b
        let remainder = (-quotient).mul_add(b, a);
        let err = if b.is_sign_negative() {
            -remainder
        } else {
            remainder
        };
        self.adjust(quotient, err)
    }

    pub(crate) fn sqrt(self, a: f64) -> f64 {
        let root = a.sqrt();
        if !root.is_finite() || root == 0.0 {
            return root;
        }

        let err = (-root).mul_add(root, a);
        self.adjust(root, err)
    }

    /// Moves the round-to-nearest `result` one ulp in this mode's direction if the exact value
    /// lies on that side, `err` is the sign of exact value minus `result`.
    fn adjust(self, result: f64, err: f64) -> f64 {
        match self {
            Self::Nearest => result,
            Self::Down if err < 0.0 => next_down(result),
            Self::Up if err > 0.0 => next_up(result),
            Self::TowardZero if result > 0.0 && err < 0.0 => next_down(result),
            Self::TowardZero if result < 0.0 && err > 0.0 => next_up(result),
            Self::Down | Self::Up | Self::TowardZero => result,
        }
    }

    /// Directed modes round an overflow to the largest finite value when rounding away from
    /// infinity.
    fn overflow(self, result: f64, finite_operands: bool) -> f64 {
        if !finite_operands || result.is_nan() {
            return result;
        }

        match self {
            Self::TowardZero => f64::MAX.copysign(result),
            Self::Down if result > 0.0 => f64::MAX,
            Self::Up if result < 0.0 => f64::MIN,
            Self::Nearest | Self::Down | Self::Up => result,
        }
    }
}

fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }

    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

fn next_down(x: f64) -> f64 {
    -next_up(-x)
}

#[cfg(test)]
#[expect(clippy::float_cmp, reason = "results must be bit exact")]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL: [RoundingMode; 4] = [
        RoundingMode::Nearest,
        RoundingMode::Down,
        RoundingMode::Up,
        RoundingMode::TowardZero,
    ];

    #[test]
    fn one_third() {
        let nearest = 1.0 / 3.0;

        assert_eq!(RoundingMode::Nearest.div(1.0, 3.0), nearest);
        assert_eq!(RoundingMode::Down.div(1.0, 3.0), nearest);
        assert_eq!(RoundingMode::TowardZero.div(1.0, 3.0), nearest);
        assert_eq!(RoundingMode::Up.div(1.0, 3.0), next_up(nearest));
        assert_eq!(RoundingMode::Up.div(-1.0, 3.0), -nearest);
        assert_eq!(RoundingMode::Down.div(-1.0, 3.0), -next_up(nearest));
    }

    #[test]
    fn one_tenth() {
        // 0.1 rounds up in round-to-nearest, so rounding down must step back.
        let nearest = 1.0 / 10.0;

        assert_eq!(RoundingMode::Up.div(1.0, 10.0), nearest);
        assert_eq!(RoundingMode::Down.div(1.0, 10.0), next_down(nearest));
        assert_eq!(RoundingMode::TowardZero.div(1.0, 10.0), next_down(nearest));
    }

    #[test]
    fn inexact_sum() {
        let tiny = f64::EPSILON / 4.0;

        assert_eq!(RoundingMode::Nearest.add(1.0, tiny), 1.0);
        assert_eq!(RoundingMode::Down.add(1.0, tiny), 1.0);
        assert_eq!(RoundingMode::Up.add(1.0, tiny), next_up(1.0));
        assert_eq!(RoundingMode::TowardZero.sub(-1.0, tiny), -1.0);
        assert_eq!(RoundingMode::Down.sub(-1.0, tiny), next_down(-1.0));
    }

    #[test]
    fn exact_results_are_unchanged() {
        for mode in ALL {
            assert_eq!(mode.add(1.5, 2.25), 3.75);
            assert_eq!(mode.mul(3.0, -0.5), -1.5);
            assert_eq!(mode.div(1.0, 4.0), 0.25);
            assert_eq!(mode.sqrt(16.0), 4.0);
        }
    }

    #[test]
    fn zero_sums() {
        assert!(RoundingMode::Down.sub(1.0, 1.0).is_sign_negative());
        assert!(RoundingMode::Nearest.sub(1.0, 1.0).is_sign_positive());
        assert!(RoundingMode::Up.add(-0.0, 0.0).is_sign_positive());
        assert!(RoundingMode::Down.add(0.0, 0.0).is_sign_positive());
        assert!(RoundingMode::Up.add(-0.0, -0.0).is_sign_negative());
    }

    #[test]
    fn sqrt_two() {
        let nearest = 2.0_f64.sqrt();
        let (low, high) = if nearest.mul_add(nearest, -2.0) > 0.0 {
            (next_down(nearest), nearest)
        } else {
            (nearest, next_up(nearest))
        };

        assert_eq!(RoundingMode::Down.sqrt(2.0), low);
        assert_eq!(RoundingMode::TowardZero.sqrt(2.0), low);
        assert_eq!(RoundingMode::Up.sqrt(2.0), high);
    }

    #[test]
    fn overflow() {
        assert_eq!(RoundingMode::Nearest.mul(f64::MAX, 2.0), f64::INFINITY);
        assert_eq!(RoundingMode::TowardZero.mul(f64::MAX, 2.0), f64::MAX);
        assert_eq!(RoundingMode::Down.mul(f64::MAX, 2.0), f64::MAX);
        assert_eq!(RoundingMode::Up.mul(f64::MAX, -2.0), f64::MIN);
        assert_eq!(RoundingMode::Up.mul(f64::MAX, 2.0), f64::INFINITY);
    }

    #[test]
    fn cfround_order() {
        assert_eq!(RoundingMode::from_u64(0), RoundingMode::Nearest);
        assert_eq!(RoundingMode::from_u64(1), RoundingMode::Down);
        assert_eq!(RoundingMode::from_u64(2), RoundingMode::Up);
        assert_eq!(RoundingMode::from_u64(7), RoundingMode::TowardZero);
    }

    fn finite() -> impl Strategy<Value = f64> {
        prop::num::f64::NORMAL.prop_filter("no overflow or subnormal results", |x| {
            x.abs() < 1e150 && x.abs() > 1e-150
        })
    }

    proptest! {
        #[test]
        fn directed_modes_bracket_nearest(a in finite(), b in finite()) {
            for (op, nearest) in [
                (0, a + b),
                (1, a * b),
                (2, a / b),
            ] {
                let apply = |mode: RoundingMode| match op {
                    0 => mode.add(a, b),
                    1 => mode.mul(a, b),
                    _ => mode.div(a, b),
                };
                let down = apply(RoundingMode::Down);
                let up = apply(RoundingMode::Up);

                prop_assert_eq!(apply(RoundingMode::Nearest), nearest);
                prop_assert!(down <= nearest && nearest <= up);
                prop_assert!(down == up || next_up(down) == up);
                prop_assert!(down == nearest || up == nearest);
                prop_assert!(apply(RoundingMode::TowardZero).abs() <= nearest.abs());
            }
        }
    }
}
