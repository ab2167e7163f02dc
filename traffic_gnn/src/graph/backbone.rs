use crate::graph::config::TrainingConfig;
use crate::graph::error::ConfigError;
use crate::graph::laplacian::ChebyshevPolynomials;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    Week,
    Day,
    Hour,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Week, Period::Day, Period::Hour];

    /// Name of the input window feeding this branch.
    pub fn window_name(&self) -> &'static str {
        match self {
            Period::Week => "week",
            Period::Day => "day",
            Period::Hour => "recent",
        }
    }
}

/// Configuration of one graph-conv block.
#[derive(Clone, Debug)]
pub struct BackboneSpec {
    pub k: usize,
    pub num_chev_filters: usize,
    pub num_time_filters: usize,
    pub time_conv_stride: usize,
    pub num_features: Option<usize>,
    pub cheb_polynomials: Arc<ChebyshevPolynomials>,
}

#[derive(Clone, Debug)]
pub struct Branch {
    pub period: Period,
    pub blocks: Vec<BackboneSpec>,
}

impl Branch {
    pub fn last(&self) -> &BackboneSpec {
        // construction guarantees at least one block
        &self.blocks[self.blocks.len() - 1]
    }
}

#[derive(Clone, Debug)]
pub struct AllBackbones {
    branches: [Branch; 3],
}

impl AllBackbones {
    /// Builds week/day/hour branches of two blocks each. The first block of a
    /// branch strides by the branch's period count, the second by one; only
    /// the hour branch's last block carries the output feature count.
    pub fn build(config: &TrainingConfig, cheb_polynomials: Arc<ChebyshevPolynomials>) -> Result<Self, ConfigError> {
        if config.k < 1 {
            return Err(ConfigError::invalid_value("k", "Chebyshev order must be >= 1"));
        }
        if cheb_polynomials.order() != config.k {
            return Err(ConfigError::invalid_value(
                "k",
                format!("kernels have order {}, config asks for {}", cheb_polynomials.order(), config.k),
            ));
        }
        let filters = &config.backbone;
        if filters.num_chev_filters == 0 || filters.num_time_filters == 0 {
            return Err(ConfigError::invalid_value("backbone", "filter counts must be >= 1"));
        }
        if filters.num_features == 0 {
            return Err(ConfigError::invalid_value("backbone.num_features", "must be >= 1"));
        }

        let block = |stride: usize, num_features: Option<usize>| BackboneSpec {
            k: config.k,
            num_chev_filters: filters.num_chev_filters,
            num_time_filters: filters.num_time_filters,
            time_conv_stride: stride,
            num_features,
            cheb_polynomials: Arc::clone(&cheb_polynomials),
        };

        let mut branches = Vec::with_capacity(3);
        for period in Period::ALL {
            let (field, count) = match period {
                Period::Week => ("num_of_weeks", config.num_of_weeks),
                Period::Day => ("num_of_days", config.num_of_days),
                Period::Hour => ("num_of_hours", config.num_of_hours),
            };
            if count == 0 {
                return Err(ConfigError::invalid_value(field, "must be >= 1"));
            }
            let num_features = (period == Period::Hour).then_some(filters.num_features);
            branches.push(Branch {
                period,
                blocks: vec![block(count, None), block(1, num_features)],
            });
        }

        let branches: [Branch; 3] = branches
            .try_into()
            .map_err(|_| ConfigError::invalid_value("backbone", "expected exactly three branches"))?;
        Ok(Self { branches })
    }

    pub fn branches(&self) -> &[Branch; 3] {
        &self.branches
    }

    pub fn branch(&self, period: Period) -> &Branch {
        &self.branches[Period::ALL.iter().position(|p| *p == period).unwrap_or(0)]
    }

    /// Output channels per forecast step.
    pub fn output_features(&self) -> usize {
        self.branch(Period::Hour).last().num_features.unwrap_or(1)
    }

    pub fn cheb_polynomials(&self) -> &Arc<ChebyshevPolynomials> {
        &self.branches[0].blocks[0].cheb_polynomials
    }
}
