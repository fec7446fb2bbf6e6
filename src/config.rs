use clap::Parser;
use serde::Serialize;

pub const DEFAULT_TUD_ROOTS: [&str; 5] = [
    "/mnt/pedestrians/tud/tud-pedestrians",
    "/mnt/pedestrians/tud/tud-campus-sequence",
    "/mnt/pedestrians/tud/TUD-Brussels",
    "/mnt/pedestrians/tud/train-210",
    "/mnt/pedestrians/tud/train-400",
];

pub const DEFAULT_INRIA_ROOT: &str = "/mnt/pedestrians/INRIA/INRIAPerson";

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "person-heatmap",
    about = "Train a CNN to predict person heatmaps on TUD and INRIA pedestrian data using Candle"
)]
pub struct TrainConfig {
    #[arg(
        long = "tud-root",
        help = "TUD dataset directory containing .idl annotations (repeatable)"
    )]
    pub tud_roots: Vec<String>,

    #[arg(
        long,
        default_value = DEFAULT_INRIA_ROOT,
        help = "Path to the INRIAPerson dataset root"
    )]
    pub inria_root: String,

    #[arg(long, default_value_t = false, help = "Skip the TUD datasets")]
    pub no_tud: bool,

    #[arg(long, default_value_t = false, help = "Skip the INRIA dataset")]
    pub no_inria: bool,

    #[arg(long, default_value_t = 240)]
    pub height: usize,

    #[arg(long, default_value_t = 320)]
    pub width: usize,

    #[arg(long, default_value_t = 32)]
    pub out_height: usize,

    #[arg(long, default_value_t = 32)]
    pub out_width: usize,

    #[arg(long, default_value_t = 1)]
    pub epochs: usize,

    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Probability of keeping a fully-connected activation during training"
    )]
    pub keep_prob: f32,

    #[arg(long, default_value_t = 0.2, help = "Share of each TUD set held out for testing")]
    pub test_fraction: f32,

    #[arg(long, default_value_t = 0)]
    pub max_samples: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value = "cpu")]
    pub device: String,

    #[arg(long, default_value = ".")]
    pub output_dir: String,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long, help = "Load initial weights from a safetensors checkpoint")]
    pub resume: Option<String>,

    #[arg(long)]
    pub cache_root: Option<String>,

    #[arg(long, default_value_t = false)]
    pub require_cache: bool,

    #[arg(long, default_value_t = 5)]
    pub log_every_batches: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Wait for Enter after writing the sample prediction"
    )]
    pub pause: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::parse_from(["person-heatmap"])
    }
}

impl TrainConfig {
    /// TUD roots to load, falling back to the standard set when none were given.
    pub fn tud_roots(&self) -> Vec<String> {
        if self.no_tud {
            return Vec::new();
        }
        if self.tud_roots.is_empty() {
            DEFAULT_TUD_ROOTS.iter().map(|root| root.to_string()).collect()
        } else {
            self.tud_roots.clone()
        }
    }

    pub fn inria_root(&self) -> Option<&str> {
        (!self.no_inria).then_some(self.inria_root.as_str())
    }

    pub fn dropout_prob(&self) -> f32 {
        1.0 - self.keep_prob
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be > 0");
        }
        if self.height == 0 || self.width == 0 {
            anyhow::bail!("--height and --width must be > 0");
        }
        if self.height % 4 != 0 || self.width % 4 != 0 {
            anyhow::bail!(
                "--height and --width must be divisible by 4 (two 2x2 pooling stages), got {}x{}",
                self.width,
                self.height
            );
        }
        if self.out_height == 0 || self.out_width == 0 {
            anyhow::bail!("--out-height and --out-width must be > 0");
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            anyhow::bail!("--keep-prob must be in (0, 1], got {}", self.keep_prob);
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            anyhow::bail!(
                "--test-fraction must be in [0, 1), got {}",
                self.test_fraction
            );
        }
        if !(self.lr > 0.0) {
            anyhow::bail!("--lr must be > 0, got {}", self.lr);
        }
        if self.no_tud && self.no_inria {
            anyhow::bail!("--no-tud and --no-inria leave no data to train on");
        }
        if self.require_cache && self.cache_root.is_none() {
            anyhow::bail!("--require-cache requires --cache-root");
        }
        Ok(())
    }
}
