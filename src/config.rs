use crate::{common::*, model::Capacity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub input: Input,
    pub pyramid: Pyramid,
    pub model: Model,
    pub train: Training,
    pub loss: Loss,
    pub logging: Logging,
    pub inference: Inference,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            input,
            pyramid,
            model,
            train,
            loss,
            inference,
            ..
        } = self;

        ensure!(
            (1..=4).contains(&input.img_channels.get()),
            "img_channels must be in 1..=4, but get {}",
            input.img_channels
        );

        let scale_factor = pyramid.scale_factor.raw();
        ensure!(
            scale_factor > 0.0 && scale_factor < 1.0,
            "scale_factor must be in range (0, 1), but get {}",
            scale_factor
        );
        ensure!(
            pyramid.min_size.get() <= pyramid.max_size.get(),
            "min_size ({}) must not exceed max_size ({})",
            pyramid.min_size,
            pyramid.max_size
        );

        ensure!(
            model.num_layers.get() >= 2,
            "num_layers must be at least 2 (head and tail), but get {}",
            model.num_layers
        );
        ensure!(model.kernel_size.get() >= 1);
        ensure!(model.stride.get() >= 1);

        {
            let num_heads = model.num_heads.get();
            let CapacitySchedule {
                nfc_init,
                min_nfc_init,
                max_nfc,
                ..
            } = model.capacity;

            for channels in [nfc_init.get(), max_nfc.get()] {
                ensure!(
                    channels % num_heads == 0 && (channels / 2) % num_heads == 0,
                    "attention requires num_heads ({}) to divide both {} and {}",
                    num_heads,
                    channels,
                    channels / 2
                );
            }
            ensure!(
                min_nfc_init.get() <= nfc_init.get() && nfc_init.get() <= max_nfc.get(),
                "capacity must satisfy min_nfc_init <= nfc_init <= max_nfc"
            );
        }

        if let Some(path) = &model.generator_path {
            ensure!(
                path.is_file(),
                "generator weights '{}' does not exist",
                path.display()
            );
        }
        if let Some(path) = &model.discriminator_path {
            ensure!(
                path.is_file(),
                "discriminator weights '{}' does not exist",
                path.display()
            );
        }

        ensure!(
            train.gamma.raw() > 0.0,
            "lr decay factor must be positive"
        );
        ensure!(
            train.milestones.windows(2).all(|pair| pair[0] < pair[1]),
            "milestones must be strictly increasing"
        );
        ensure!(loss.gp_weight.raw() >= 0.0 && loss.rec_weight.raw() >= 0.0);

        ensure!(
            inference.scale_h.raw() > 0.0 && inference.scale_w.raw() > 0.0,
            "inference scale_h and scale_w must be positive"
        );

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub image_path: PathBuf,
    pub img_channels: NonZeroUsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pyramid {
    pub scale_factor: R64,
    /// Derived from `min_size` and `max_size` when absent.
    #[serde(default)]
    pub stop_scale: Option<usize>,
    pub min_size: NonZeroUsize,
    pub max_size: NonZeroUsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub kernel_size: NonZeroUsize,
    pub num_layers: NonZeroUsize,
    pub stride: NonZeroUsize,
    pub num_heads: NonZeroUsize,
    pub capacity: CapacitySchedule,
    #[serde(default)]
    pub generator_path: Option<PathBuf>,
    #[serde(default)]
    pub discriminator_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacitySchedule {
    pub nfc_init: NonZeroUsize,
    pub min_nfc_init: NonZeroUsize,
    #[serde(default = "default_max_nfc")]
    pub max_nfc: NonZeroUsize,
    #[serde(default = "default_double_every")]
    pub double_every: NonZeroUsize,
}

impl CapacitySchedule {
    /// Channel counts of level `level`, doubling every `double_every`
    /// levels up to `max_nfc`.
    pub fn at(&self, level: usize) -> Capacity {
        let Self {
            nfc_init,
            min_nfc_init,
            max_nfc,
            double_every,
        } = *self;
        let factor = 1usize
            .checked_shl((level / double_every.get()) as u32)
            .unwrap_or(usize::MAX);
        let grow = |init: NonZeroUsize| init.get().saturating_mul(factor).min(max_nfc.get());

        Capacity {
            nfc: grow(nfc_init),
            min_nfc: grow(min_nfc_init),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    #[serde(default)]
    pub seed: Option<i64>,
    pub num_iter: NonZeroUsize,
    pub n_critic: NonZeroUsize,
    pub generator_iter: NonZeroUsize,
    pub g_lr: R64,
    pub d_lr: R64,
    pub beta1: R64,
    pub beta2: R64,
    pub milestones: Vec<usize>,
    pub gamma: R64,
    pub noise_amp_init: R64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loss {
    pub gp_weight: R64,
    pub rec_weight: R64,
    pub use_acm_oth: bool,
    pub acm_weight: R64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub exp_dir: PathBuf,
    pub img_save_iter: NonZeroUsize,
    pub save_attention_map: bool,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inference {
    pub infer_dir: PathBuf,
    pub num_samples: NonZeroUsize,
    pub scale_h: R64,
    pub scale_w: R64,
    pub gen_start_scale: usize,
    pub use_fixed_noise: bool,
    pub save_all_pyramid: bool,
    pub save_attention_map: bool,
    pub sr_iterations: NonZeroUsize,
}

fn default_max_nfc() -> NonZeroUsize {
    NonZeroUsize::new(128).unwrap()
}

fn default_double_every() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}
