//! Test statistics and p-values from residual correlations
//!
//! Both models reduce to the regularized incomplete beta function:
//! for a correlation `r` on `df` residual degrees of freedom the two-sided
//! t-test p-value is `I_{1-r^2}(df/2, 1/2)`, and for an ANOVA with
//! explained fraction `R^2` the F-test p-value is `I_{1-R^2}(df2/2, df1/2)`.

use statrs::function::beta::beta_reg;

/// Statistic, p-value and effect size of one tested pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairStatistic {
    pub statistic: f64,
    pub pvalue: f64,
    pub effect_size: f64,
}

/// t statistic for correlation `r` on `df` degrees of freedom
pub fn t_statistic(r: f64, df: f64) -> f64 {
    let r = r.clamp(-1.0, 1.0);
    let denom = 1.0 - r * r;
    if denom <= 0.0 {
        return if r > 0.0 { f64::INFINITY } else { f64::NEG_INFINITY };
    }
    r * (df / denom).sqrt()
}

/// Two-sided p-value of correlation `r` on `df` degrees of freedom
pub fn correlation_pvalue(r: f64, df: f64) -> f64 {
    let x = (1.0 - r * r).clamp(0.0, 1.0);
    beta_reg(df / 2.0, 0.5, x).clamp(0.0, 1.0)
}

/// F statistic for explained fraction `r2` with `df1`, `df2` degrees of freedom
pub fn f_statistic(r2: f64, df1: f64, df2: f64) -> f64 {
    let r2 = r2.clamp(0.0, 1.0);
    let denom = 1.0 - r2;
    if denom <= 0.0 {
        return f64::INFINITY;
    }
    (r2 / df1) / (denom / df2)
}

/// Upper-tail p-value of the F test for explained fraction `r2`
pub fn anova_pvalue(r2: f64, df1: f64, df2: f64) -> f64 {
    let x = (1.0 - r2).clamp(0.0, 1.0);
    beta_reg(df2 / 2.0, df1 / 2.0, x).clamp(0.0, 1.0)
}

/// Linear-model test of one pair from unit residual rows
///
/// `norm_v` and `norm_t` are the residual norms of the variant and the
/// trait; the effect size is the regression slope of trait on variant.
pub fn linear_test(r: f64, df: f64, norm_v: f64, norm_t: f64) -> PairStatistic {
    let r = r.clamp(-1.0, 1.0);
    PairStatistic {
        statistic: t_statistic(r, df),
        pvalue: correlation_pvalue(r, df),
        effect_size: r * norm_t / norm_v,
    }
}

/// ANOVA test of one pair; effect size is undefined
pub fn anova_test(r2: f64, df1: f64, df2: f64) -> PairStatistic {
    let r2 = r2.clamp(0.0, 1.0);
    PairStatistic {
        statistic: f_statistic(r2, df1, df2),
        pvalue: anova_pvalue(r2, df1, df2),
        effect_size: f64::NAN,
    }
}
