use crate::graph::backbone::{AllBackbones, BackboneSpec};
use crate::graph::config::ModelKind;
use crate::graph::error::ConfigError;
use crate::graph::laplacian::ChebyshevPolynomials;
use burn::module::{ModuleMapper, Param, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::Distribution;

/// Chebyshev terms resident on one device.
#[derive(Clone, Debug)]
pub struct ChebyshevBasis<B: Backend> {
    terms: Vec<Tensor<B, 2>>,
}

impl<B: Backend> ChebyshevBasis<B> {
    pub fn from_polynomials(polynomials: &ChebyshevPolynomials, device: &B::Device) -> Self {
        let n = polynomials.num_vertices();
        let terms = (0..polynomials.order())
            .map(|k| Tensor::from_data(TensorData::new(polynomials.term_row_major(k), [n, n]), device))
            .collect();
        Self { terms }
    }

    pub fn order(&self) -> usize {
        self.terms.len()
    }

    pub fn terms(&self) -> &[Tensor<B, 2>] {
        &self.terms
    }
}

/// Shape of one input window, without the batch axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowShape {
    pub vertices: usize,
    pub features: usize,
    pub steps: usize,
}

impl WindowShape {
    pub fn dims(&self) -> [usize; 3] {
        [self.vertices, self.features, self.steps]
    }
}

/// Length of the time axis after a block striding by `stride`.
pub fn strided_steps(steps: usize, stride: usize) -> usize {
    (steps - 1) / stride + 1
}

#[derive(Module, Debug)]
pub struct ChebConv<B: Backend> {
    theta: Param<Tensor<B, 3>>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> ChebConv<B> {
    fn new(k: usize, in_features: usize, out_features: usize, device: &B::Device) -> Self {
        let theta = Initializer::XavierUniform { gain: 1.0 }.init_with(
            [k, in_features, out_features],
            Some(in_features),
            Some(out_features),
            device,
        );
        Self {
            theta,
            in_features,
            out_features,
        }
    }

    /// `x` is `[batch, vertex, feature, time]`; returns `[batch, vertex, time, filter]`.
    /// With `attention` (`[batch, vertex, vertex]`) every kernel is reweighted
    /// element-wise before propagation.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        basis: &ChebyshevBasis<B>,
        attention: Option<Tensor<B, 3>>,
    ) -> Tensor<B, 4> {
        let [batch, vertices, features, steps] = x.dims();
        let theta = self.theta.val();
        let mut output = Tensor::zeros([batch, vertices, steps, self.out_features], &x.device());

        for (k, t_k) in basis.terms().iter().enumerate() {
            let propagated = match &attention {
                None => t_k
                    .clone()
                    .matmul(x.clone().swap_dims(0, 1).reshape([vertices, batch * features * steps]))
                    .reshape([vertices, batch, features, steps])
                    .swap_dims(0, 1),
                Some(s) => t_k
                    .clone()
                    .unsqueeze::<3>()
                    .mul(s.clone())
                    .matmul(x.clone().reshape([batch, vertices, features * steps]))
                    .reshape([batch, vertices, features, steps]),
            };

            let weight = theta
                .clone()
                .slice([k..k + 1])
                .reshape([self.in_features, self.out_features]);
            let term = propagated
                .swap_dims(2, 3)
                .reshape([batch * vertices * steps, features])
                .matmul(weight)
                .reshape([batch, vertices, steps, self.out_features]);
            output = output + term;
        }

        relu(output)
    }
}

/// Dot-product spatial and temporal attention with learned biases.
#[derive(Module, Debug)]
pub struct StAttention<B: Backend> {
    temporal_bias: Param<Tensor<B, 2>>,
    spatial_bias: Param<Tensor<B, 2>>,
}

impl<B: Backend> StAttention<B> {
    fn new(vertices: usize, steps: usize, device: &B::Device) -> Self {
        Self {
            temporal_bias: Initializer::Zeros.init([steps, steps], device),
            spatial_bias: Initializer::Zeros.init([vertices, vertices], device),
        }
    }

    /// `[batch, time, time]`, each column a distribution over source steps.
    pub fn temporal(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, vertices, features, steps] = x.dims();
        let q = x.reshape([batch, vertices * features, steps]).swap_dims(1, 2);
        let scores = q
            .clone()
            .matmul(q.swap_dims(1, 2))
            .div_scalar(((vertices * features) as f32).sqrt());
        softmax(scores + self.temporal_bias.val().unsqueeze::<3>(), 1)
    }

    /// `[batch, vertex, vertex]`.
    pub fn spatial(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, vertices, features, steps] = x.dims();
        let q = x.reshape([batch, vertices, features * steps]);
        let scores = q
            .clone()
            .matmul(q.swap_dims(1, 2))
            .div_scalar(((features * steps) as f32).sqrt());
        softmax(scores + self.spatial_bias.val().unsqueeze::<3>(), 1)
    }
}

#[derive(Module, Debug)]
pub struct StBlock<B: Backend> {
    attention: Option<StAttention<B>>,
    cheb_conv: ChebConv<B>,
    time_conv: Conv2d<B>,
    residual_conv: Conv2d<B>,
    layer_norm: LayerNorm<B>,
}

impl<B: Backend> StBlock<B> {
    fn new(spec: &BackboneSpec, input: WindowShape, with_attention: bool, device: &B::Device) -> Self {
        let stride = spec.time_conv_stride;
        Self {
            attention: with_attention.then(|| StAttention::new(input.vertices, input.steps, device)),
            cheb_conv: ChebConv::new(spec.k, input.features, spec.num_chev_filters, device),
            time_conv: Conv2dConfig::new([spec.num_chev_filters, spec.num_time_filters], [1, 3])
                .with_stride([1, stride])
                .with_padding(PaddingConfig2d::Explicit(0, 1))
                .init(device),
            residual_conv: Conv2dConfig::new([input.features, spec.num_time_filters], [1, 1])
                .with_stride([1, stride])
                .init(device),
            layer_norm: LayerNormConfig::new(spec.num_time_filters).init(device),
        }
    }

    /// `[batch, vertex, feature, time]` in, `[batch, vertex, filter, time']` out.
    pub fn forward(&self, x: Tensor<B, 4>, basis: &ChebyshevBasis<B>) -> Tensor<B, 4> {
        let spatial = self.attention.as_ref().map(|attention| {
            let [batch, vertices, features, steps] = x.dims();
            let temporal = attention.temporal(x.clone());
            let x_tat = x
                .clone()
                .reshape([batch, vertices * features, steps])
                .matmul(temporal)
                .reshape([batch, vertices, features, steps]);
            attention.spatial(x_tat)
        });

        let graph = self
            .cheb_conv
            .forward(x.clone(), basis, spatial)
            .permute([0, 3, 1, 2]);
        let time = self.time_conv.forward(graph);
        let residual = self.residual_conv.forward(x.swap_dims(1, 2));

        let out = relu(time + residual).permute([0, 2, 3, 1]);
        self.layer_norm.forward(out).swap_dims(2, 3)
    }
}

#[derive(Module, Debug)]
pub struct StBranch<B: Backend> {
    blocks: Vec<StBlock<B>>,
    head: Linear<B>,
}

impl<B: Backend> StBranch<B> {
    pub fn forward(&self, x: Tensor<B, 4>, basis: &ChebyshevBasis<B>) -> Tensor<B, 3> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x, basis);
        }
        let [batch, vertices, filters, steps] = x.dims();
        self.head.forward(x.reshape([batch, vertices, filters * steps]))
    }
}

/// Three-branch forecaster. MSTGCN and ASTGCN share this structure; ASTGCN
/// blocks carry attention.
#[derive(Module, Debug)]
pub struct Stgcn<B: Backend> {
    branches: Vec<StBranch<B>>,
    fusion: Vec<Param<Tensor<B, 2>>>,
    num_vertices: usize,
    prediction_width: usize,
}

impl<B: Backend> Stgcn<B> {
    /// Forecast `[batch, vertex, horizon × features]`.
    pub fn forward(
        &self,
        week: Tensor<B, 4>,
        day: Tensor<B, 4>,
        recent: Tensor<B, 4>,
        basis: &ChebyshevBasis<B>,
    ) -> Tensor<B, 3> {
        let batch = recent.dims()[0];
        let mut output = Tensor::zeros([batch, self.num_vertices, self.prediction_width], &recent.device());

        for ((branch, weight), x) in self.branches.iter().zip(&self.fusion).zip([week, day, recent]) {
            output = output + branch.forward(x, basis) * weight.val().unsqueeze::<3>();
        }
        output
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn prediction_width(&self) -> usize {
        self.prediction_width
    }
}

/// Instantiates the requested architecture from validated backbones.
/// `inputs` are the week, day and recent window shapes.
pub fn build_model<B: Backend>(
    kind: ModelKind,
    backbones: &AllBackbones,
    inputs: [WindowShape; 3],
    num_for_predict: usize,
    device: &B::Device,
) -> Result<Stgcn<B>, ConfigError> {
    let num_vertices = backbones.cheb_polynomials().num_vertices();
    let prediction_width = num_for_predict * backbones.output_features();
    if prediction_width == 0 {
        return Err(ConfigError::invalid_value("num_for_predict", "must be >= 1"));
    }
    let with_attention = kind == ModelKind::Astgcn;

    let mut branches = Vec::with_capacity(3);
    let mut fusion = Vec::with_capacity(3);
    for (branch, input) in backbones.branches().iter().zip(inputs) {
        if input.vertices != num_vertices {
            return Err(ConfigError::invalid_value(
                "num_of_vertices",
                format!(
                    "{} window has {} vertices, the graph has {num_vertices}",
                    branch.period.window_name(),
                    input.vertices
                ),
            ));
        }
        if input.features == 0 || input.steps == 0 {
            return Err(ConfigError::invalid_value(
                "data",
                format!("{} window is empty", branch.period.window_name()),
            ));
        }

        let mut shape = input;
        let mut blocks = Vec::with_capacity(branch.blocks.len());
        for spec in &branch.blocks {
            blocks.push(StBlock::new(spec, shape, with_attention, device));
            shape = WindowShape {
                vertices: num_vertices,
                features: spec.num_time_filters,
                steps: strided_steps(shape.steps, spec.time_conv_stride),
            };
        }

        branches.push(StBranch {
            blocks,
            head: LinearConfig::new(shape.features * shape.steps, prediction_width).init(device),
        });
        fusion.push(Initializer::Ones.init([num_vertices, prediction_width], device));
    }

    Ok(Stgcn {
        branches,
        fusion,
        num_vertices,
        prediction_width,
    })
}

/// Re-initializes every float parameter: rank-1 tensors (biases, norm
/// scales) uniformly in `±uniform_scale`, higher ranks Xavier-uniform with
/// bound `sqrt(magnitude / ((fan_in + fan_out) / 2))`.
#[derive(Clone, Debug)]
pub struct TwoTierInit {
    pub uniform_scale: f64,
    pub xavier_magnitude: f64,
}

impl Default for TwoTierInit {
    fn default() -> Self {
        Self {
            uniform_scale: 0.07,
            xavier_magnitude: 3.0,
        }
    }
}

impl TwoTierInit {
    pub fn bound(&self, dims: &[usize]) -> f64 {
        if dims.len() < 2 {
            return self.uniform_scale;
        }
        let receptive: usize = dims[2..].iter().product();
        let fan_out = dims[0] * receptive;
        let fan_in = dims[1] * receptive;
        (self.xavier_magnitude / ((fan_in + fan_out) as f64 / 2.0)).sqrt()
    }
}

impl<B: Backend> ModuleMapper<B> for TwoTierInit {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let dims = tensor.dims();
        let bound = self.bound(&dims);
        Tensor::random(dims, Distribution::Uniform(-bound, bound), &tensor.device())
            .set_require_grad(tensor.is_require_grad())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::config::{BackboneConfig, TrainingConfig};
    use crate::graph::laplacian::AdjacencyMatrix;
    use burn::backend::NdArray;
    use burn::module::ModuleVisitor;
    use burn::tensor::ElementConversion;
    use nalgebra::DMatrix;
    use std::sync::Arc;

    type TestBackend = NdArray;

    fn backbones(k: usize, num_features: usize) -> AllBackbones {
        let adjacency = AdjacencyMatrix::new(DMatrix::from_fn(4, 4, |i, j| if i == j { 0.0 } else { 1.0 })).unwrap();
        let cheb = Arc::new(ChebyshevPolynomials::from_adjacency(&adjacency, k).unwrap());
        let config = TrainingConfig::new(
            k,
            1,
            2,
            3,
            "MSTGCN".to_string(),
            "adam".to_string(),
            1e-3,
            1,
            2,
            false,
            1e-3,
            BackboneConfig::new()
                .with_num_chev_filters(4)
                .with_num_time_filters(5)
                .with_num_features(num_features),
        );
        AllBackbones::build(&config, cheb).unwrap()
    }

    fn shapes(horizon: usize) -> [WindowShape; 3] {
        [1, 2, 3].map(|periods| WindowShape {
            vertices: 4,
            features: 2,
            steps: periods * horizon,
        })
    }

    #[test]
    fn strided_steps_match_period_windows() {
        assert_eq!(strided_steps(12, 1), 12);
        assert_eq!(strided_steps(12, 3), 4);
        assert_eq!(strided_steps(24, 2), 12);
        assert_eq!(strided_steps(1, 4), 1);
    }

    #[test]
    fn forward_shapes_for_both_architectures() {
        let device = Default::default();
        let backbones = backbones(3, 2);
        let basis = ChebyshevBasis::<TestBackend>::from_polynomials(backbones.cheb_polynomials(), &device);

        for kind in [ModelKind::Mstgcn, ModelKind::Astgcn] {
            let model = build_model::<TestBackend>(kind, &backbones, shapes(3), 3, &device).unwrap();
            let [week, day, recent] = shapes(3).map(|s| {
                Tensor::<TestBackend, 4>::random([5, s.vertices, s.features, s.steps], Distribution::Default, &device)
            });
            let output = model.forward(week, day, recent, &basis);
            assert_eq!(output.dims(), [5, 4, 6]);
            assert_eq!(model.prediction_width(), 6);
        }
    }

    #[test]
    fn vertex_mismatch_is_rejected() {
        let device = Default::default();
        let mut inputs = shapes(2);
        inputs[1].vertices = 7;
        assert!(build_model::<TestBackend>(ModelKind::Mstgcn, &backbones(2, 1), inputs, 2, &device).is_err());
    }

    struct RankOneBounds {
        max_abs: f32,
        seen: usize,
    }

    impl<B: Backend> ModuleVisitor<B> for RankOneBounds {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            if D == 1 {
                let max = tensor.clone().abs().max().into_scalar().elem::<f32>();
                self.max_abs = self.max_abs.max(max);
                self.seen += 1;
            }
        }
    }

    #[test]
    fn two_tier_init_bounds() {
        let init = TwoTierInit::default();
        assert_eq!(init.bound(&[16]), 0.07);
        // conv weight [out=8, in=4, 1, 3]: fans 12 and 24
        assert!((init.bound(&[8, 4, 1, 3]) - (3.0f64 / 18.0).sqrt()).abs() < 1e-12);

        let device = Default::default();
        let model = build_model::<TestBackend>(ModelKind::Mstgcn, &backbones(2, 1), shapes(2), 2, &device)
            .unwrap()
            .map(&mut TwoTierInit::default());

        let mut visitor = RankOneBounds { max_abs: 0.0, seen: 0 };
        model.visit(&mut visitor);
        // layer norm scales start at one and must have been redrawn
        assert!(visitor.seen > 0);
        assert!(visitor.max_abs <= 0.07 + 1e-6);
    }
}
