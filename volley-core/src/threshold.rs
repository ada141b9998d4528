//! Threshold rule grammar.
//!
//! A threshold attaches one or more rules to a metric (or submetric). Each rule compares a single
//! statistic of the metric against a literal bound, e.g. `p(95)<500` or `rate <= 0.05`.
use crate::error::ConfigError;
use crate::metrics::{MetricKind, MetricSelector};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    /// Counter: sum of added values. Trend: number of samples.
    Count,
    /// Rate: fraction of non-zero samples. Counter: sum per second of run time.
    Rate,
    /// Gauge: latest value.
    Value,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
}

impl Statistic {
    fn parse(s: &str) -> Option<Self> {
        let stat = match s {
            "count" => Statistic::Count,
            "rate" => Statistic::Rate,
            "value" => Statistic::Value,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            _ => {
                let inner = s.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = inner.trim().parse().ok()?;
                if !(0. ..=100.).contains(&p) {
                    return None;
                }
                Statistic::Percentile(p)
            }
        };
        Some(stat)
    }

    pub fn applies_to(&self, kind: MetricKind) -> bool {
        use Statistic::*;
        match kind {
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Gauge => matches!(self, Value | Min | Max),
            MetricKind::Rate => matches!(self, Rate),
            MetricKind::Trend => matches!(self, Count | Avg | Min | Max | Med | Percentile(_)),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => f.write_str("count"),
            Statistic::Rate => f.write_str("rate"),
            Statistic::Value => f.write_str("value"),
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub bound: f64,
    /// The expression as written in the configuration.
    pub source: String,
    /// Stop the run as soon as this rule fails during continuous evaluation.
    pub abort_on_fail: bool,
    /// Skip continuous evaluation of this rule until the run is at least this old.
    pub delay_abort_eval: Option<Duration>,
}

impl Rule {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let err = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let expr = expression.trim();
        let idx = expr
            .find(['<', '>'])
            .ok_or_else(|| err("expected one of <, <=, >, >="))?;

        let (lhs, rest) = expr.split_at(idx);
        let (comparator, rhs) = match (rest.as_bytes()[0], rest[1..].strip_prefix('=')) {
            (b'<', Some(rhs)) => (Comparator::Le, rhs),
            (b'<', None) => (Comparator::Lt, &rest[1..]),
            (b'>', Some(rhs)) => (Comparator::Ge, rhs),
            _ => (Comparator::Gt, &rest[1..]),
        };

        let lhs = lhs.trim();
        if lhs.ends_with(['=', '!']) {
            return Err(err("only <, <=, > and >= are supported"));
        }
        let statistic = Statistic::parse(lhs).ok_or_else(|| err("unknown statistic"))?;

        let bound: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| err("bound is not a number"))?;
        if !bound.is_finite() {
            return Err(err("bound must be finite"));
        }

        Ok(Self {
            statistic,
            comparator,
            bound,
            source: expr.to_string(),
            abort_on_fail: false,
            delay_abort_eval: None,
        })
    }

    pub fn abort_on_fail(mut self, delay: Option<Duration>) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }
}

/// All rules attached to one metric or submetric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub rules: Vec<Rule>,
}

impl Threshold {
    pub fn parse<S: AsRef<str>>(key: &str, expressions: &[S]) -> Result<Self, ConfigError> {
        let selector = MetricSelector::parse(key)?;
        let rules = expressions
            .iter()
            .map(|e| Rule::parse(key, e.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { selector, rules })
    }

    /// Check the threshold against the kind of the metric it names (`None` when the metric is
    /// not registered).
    pub fn validate(&self, kind: Option<MetricKind>) -> Result<(), ConfigError> {
        let kind = kind.ok_or_else(|| ConfigError::UnknownMetric(self.selector.name.clone()))?;
        for rule in &self.rules {
            if !rule.statistic.applies_to(kind) {
                return Err(ConfigError::StatisticMismatch {
                    metric: self.selector.to_string(),
                    kind: kind.to_string(),
                    statistic: rule.statistic.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_percentile_rule() {
        let rule = Rule::parse("http_req_duration", "p(95)<500").unwrap();
        assert_eq!(rule.statistic, Statistic::Percentile(95.));
        assert_eq!(rule.comparator, Comparator::Lt);
        assert_eq!(rule.bound, 500.);
        assert_eq!(rule.source, "p(95)<500");
    }

    #[test]
    fn parses_all_comparators_with_whitespace() {
        let cases = [
            ("rate < 0.05", Comparator::Lt),
            ("rate <= 0.05", Comparator::Le),
            ("rate > 0.05", Comparator::Gt),
            ("rate >= 0.05", Comparator::Ge),
        ];
        for (expr, cmp) in cases {
            let rule = Rule::parse("errors", expr).unwrap();
            assert_eq!(rule.statistic, Statistic::Rate);
            assert_eq!(rule.comparator, cmp, "{expr}");
            assert_eq!(rule.bound, 0.05);
        }
    }

    #[test]
    fn parses_fractional_percentile() {
        let rule = Rule::parse("http_req_duration", "p( 99.9 ) <= 1e3").unwrap();
        assert_eq!(rule.statistic, Statistic::Percentile(99.9));
        assert_eq!(rule.bound, 1000.);
    }

    #[test]
    fn rejects_malformed_rules() {
        for expr in [
            "p(95)",
            "p(95)==500",
            "p(95)!=500",
            "p(101)<5",
            "median<5",
            "avg<fast",
            "avg<inf",
            "<5",
        ] {
            assert!(
                matches!(
                    Rule::parse("m", expr),
                    Err(ConfigError::InvalidThreshold { .. })
                ),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn comparator_semantics() {
        assert!(Comparator::Lt.holds(1., 2.));
        assert!(!Comparator::Lt.holds(2., 2.));
        assert!(Comparator::Le.holds(2., 2.));
        assert!(Comparator::Gt.holds(3., 2.));
        assert!(!Comparator::Gt.holds(2., 2.));
        assert!(Comparator::Ge.holds(2., 2.));
    }

    #[test]
    fn statistic_kind_validation() {
        let threshold = Threshold::parse("http_req_failed", &["p(95)<1"]).unwrap();
        assert!(matches!(
            threshold.validate(Some(MetricKind::Rate)),
            Err(ConfigError::StatisticMismatch { .. })
        ));

        let threshold = Threshold::parse("http_req_duration", &["p(95)<500", "avg<200"]).unwrap();
        assert!(threshold.validate(Some(MetricKind::Trend)).is_ok());

        assert!(matches!(
            threshold.validate(None),
            Err(ConfigError::UnknownMetric(name)) if name == "http_req_duration"
        ));
    }
}
