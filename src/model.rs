use candle_core::{Device, Error, Result, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Linear, Module, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

pub const WEIGHT_STDDEV: f32 = 0.1;
pub const BIAS_INIT: f32 = 0.1;
const PATCH_SIZE: usize = 5;
const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;
const HIDDEN_UNITS: usize = 512;

#[derive(Clone, Debug)]
pub struct PersonNetConfig {
    pub image_height: usize,
    pub image_width: usize,
    pub out_height: usize,
    pub out_width: usize,
    /// Probability of zeroing a hidden activation while training.
    pub dropout: f32,
}

impl PersonNetConfig {
    pub fn output_len(&self) -> usize {
        self.out_height * self.out_width
    }

    /// Flattened feature count after the two 2x2 pooling stages.
    pub fn flat_len(&self) -> usize {
        CONV2_CHANNELS * (self.image_height / 4) * (self.image_width / 4)
    }
}

/// Registers freshly initialized parameters in a `VarMap` so the optimizer and
/// checkpointing see them.
pub struct ParamInit<'a> {
    varmap: &'a VarMap,
    device: &'a Device,
    rng: StdRng,
}

impl<'a> ParamInit<'a> {
    pub fn new(varmap: &'a VarMap, device: &'a Device, seed: u64) -> Self {
        Self {
            varmap,
            device,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn weight(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let count = shape.iter().product();
        let values = truncated_normal(count, WEIGHT_STDDEV, &mut self.rng)?;
        let tensor = Tensor::from_vec(values, shape, self.device)?;
        self.register(name, tensor)
    }

    pub fn bias(&mut self, name: &str, len: usize) -> Result<Tensor> {
        let tensor = Tensor::full(BIAS_INIT, len, self.device)?;
        self.register(name, tensor)
    }

    fn register(&self, name: &str, tensor: Tensor) -> Result<Tensor> {
        let var = Var::from_tensor(&tensor)?;
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("variable map lock poisoned".to_string()))?;
        data.insert(name.to_string(), var.clone());
        Ok(var.as_tensor().clone())
    }
}

/// Normal samples with everything beyond two standard deviations redrawn.
pub fn truncated_normal(count: usize, stddev: f32, rng: &mut StdRng) -> Result<Vec<f32>> {
    let normal = Normal::new(0f32, stddev)
        .map_err(|err| Error::Msg(format!("invalid weight stddev {stddev}: {err}")))?;
    let limit = 2.0 * stddev;
    let mut values = Vec::with_capacity(count);
    while values.len() < count {
        let value = normal.sample(rng);
        if value.abs() <= limit {
            values.push(value);
        }
    }
    Ok(values)
}

/// Two conv/pool stages, a dropout-regularized hidden layer and a linear
/// readout mapped to `(raw + 1) / 2`.
#[derive(Debug)]
pub struct PersonNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    dropout: Dropout,
    readout: Linear,
}

impl PersonNet {
    pub fn new(cfg: &PersonNetConfig, varmap: &VarMap, device: &Device, seed: u64) -> Result<Self> {
        if cfg.image_height % 4 != 0 || cfg.image_width % 4 != 0 {
            return Err(Error::Msg(format!(
                "input size {}x{} must be divisible by 4",
                cfg.image_width, cfg.image_height
            )));
        }

        let mut init = ParamInit::new(varmap, device, seed);
        let conv_cfg = Conv2dConfig {
            padding: PATCH_SIZE / 2,
            ..Default::default()
        };

        let conv1 = Conv2d::new(
            init.weight("conv1.weight", &[CONV1_CHANNELS, 3, PATCH_SIZE, PATCH_SIZE])?,
            Some(init.bias("conv1.bias", CONV1_CHANNELS)?),
            conv_cfg,
        );
        let conv2 = Conv2d::new(
            init.weight(
                "conv2.weight",
                &[CONV2_CHANNELS, CONV1_CHANNELS, PATCH_SIZE, PATCH_SIZE],
            )?,
            Some(init.bias("conv2.bias", CONV2_CHANNELS)?),
            conv_cfg,
        );
        let fc1 = Linear::new(
            init.weight("fc1.weight", &[HIDDEN_UNITS, cfg.flat_len()])?,
            Some(init.bias("fc1.bias", HIDDEN_UNITS)?),
        );
        let readout = Linear::new(
            init.weight("readout.weight", &[cfg.output_len(), HIDDEN_UNITS])?,
            Some(init.bias("readout.bias", cfg.output_len())?),
        );

        Ok(Self {
            conv1,
            conv2,
            fc1,
            dropout: Dropout::new(cfg.dropout),
            readout,
        })
    }

    /// `x` is `(N, 3, H, W)`; returns `(N, out_h * out_w)`.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?.max_pool2d(2)?;
        let x = self.conv2.forward(&x)?.relu()?.max_pool2d(2)?;
        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let raw = self.readout.forward(&x)?;
        raw.affine(0.5, 0.5)
    }

    /// First-layer kernels as `[kh, kw, in, out]`.
    pub fn conv1_weight_hwio(&self) -> Result<Tensor> {
        self.conv1.weight().permute((2, 3, 1, 0))?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg() -> PersonNetConfig {
        PersonNetConfig {
            image_height: 8,
            image_width: 12,
            out_height: 2,
            out_width: 3,
            dropout: 0.5,
        }
    }

    #[test]
    fn truncated_normal_stays_within_two_sigma() {
        let mut rng = StdRng::seed_from_u64(7);
        let values = truncated_normal(10_000, 0.1, &mut rng).unwrap();
        assert_eq!(values.len(), 10_000);
        assert!(values.iter().all(|v| v.abs() <= 0.2));
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.01, "mean={mean}");
    }

    #[test]
    fn registers_every_parameter() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        PersonNet::new(&tiny_cfg(), &varmap, &device, 0).unwrap();

        let data = varmap.data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            [
                "conv1.bias",
                "conv1.weight",
                "conv2.bias",
                "conv2.weight",
                "fc1.bias",
                "fc1.weight",
                "readout.bias",
                "readout.weight"
            ]
        );
        assert_eq!(data["fc1.weight"].dims(), &[512, 64 * 2 * 3]);
        let bias = data["conv1.bias"].as_tensor().to_vec1::<f32>().unwrap();
        assert!(bias.iter().all(|&b| (b - BIAS_INIT).abs() < 1e-7));
    }

    #[test]
    fn forward_shape_and_hwio_export() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let model = PersonNet::new(&tiny_cfg(), &varmap, &device, 1).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 3, 8, 12), &device).unwrap();

        assert_eq!(model.forward_t(&x, false).unwrap().dims(), &[2, 6]);
        assert_eq!(model.forward_t(&x, true).unwrap().dims(), &[2, 6]);
        assert_eq!(model.conv1_weight_hwio().unwrap().dims(), &[5, 5, 3, 32]);
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let model = PersonNet::new(&tiny_cfg(), &varmap, &device, 2).unwrap();
        let x = Tensor::rand(0f32, 1f32, (1, 3, 8, 12), &device).unwrap();
        let a = model.forward_t(&x, false).unwrap().to_vec2::<f32>().unwrap();
        let b = model.forward_t(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_weights_give_shifted_bias() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let model = PersonNet::new(&tiny_cfg(), &varmap, &device, 3).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            let readout = &data["readout.weight"];
            readout.set(&readout.zeros_like().unwrap()).unwrap();
        }
        let x = Tensor::rand(0f32, 1f32, (1, 3, 8, 12), &device).unwrap();
        let y = model.forward_t(&x, false).unwrap().flatten_all().unwrap();
        for value in y.to_vec1::<f32>().unwrap() {
            assert!((value - (BIAS_INIT + 1.0) / 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_sizes_not_divisible_by_four() {
        let mut cfg = tiny_cfg();
        cfg.image_width = 10;
        assert!(PersonNet::new(&cfg, &VarMap::new(), &Device::Cpu, 0).is_err());
    }
}
