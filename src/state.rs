use crate::{
    common::*,
    model::{
        Capacity, DiscriminatorOutput, ModelShape, ScaleModels, ScaleModelsInit,
        DISCRIMINATOR_FILE, GENERATOR_FILE,
    },
    noise::Padding,
};

pub const MANIFEST_FILE: &str = "pyramid.json";
pub const REALS_FILE: &str = "reals.ot";
pub const FIXED_NOISES_FILE: &str = "fixed_noises.ot";
const MANIFEST_VERSION: usize = 1;

/// A level fresh out of training, still open to modification.
#[derive(Debug)]
pub struct TrainedLevel {
    pub models: ScaleModels,
    /// Padded reconstruction noise seed.
    pub fixed_noise: Tensor,
    pub noise_amp: f64,
}

impl TrainedLevel {
    /// Freezes both networks. The result only runs in evaluation mode.
    pub fn seal(self) -> FrozenLevel {
        let Self {
            mut models,
            fixed_noise,
            noise_amp,
        } = self;
        models.freeze();

        FrozenLevel {
            models,
            fixed_noise: fixed_noise.detach(),
            noise_amp,
        }
    }
}

#[derive(Debug)]
pub struct FrozenLevel {
    models: ScaleModels,
    fixed_noise: Tensor,
    noise_amp: f64,
}

impl FrozenLevel {
    pub fn generate(&self, noisy_input: &Tensor, prev: &Tensor) -> Result<Tensor> {
        self.models.generator.forward_t(noisy_input, prev, false)
    }

    pub fn discriminate(&self, image: &Tensor) -> Result<DiscriminatorOutput> {
        self.models.discriminator.forward_t(image, false)
    }

    pub fn models(&self) -> &ScaleModels {
        &self.models
    }

    pub fn capacity(&self) -> Capacity {
        self.models.capacity
    }

    pub fn fixed_noise(&self) -> &Tensor {
        &self.fixed_noise
    }

    pub fn noise_amp(&self) -> f64 {
        self.noise_amp
    }
}

/// The real-image pyramid plus the append-only list of sealed levels.
#[derive(Debug)]
pub struct TrainedPyramid {
    shape: ModelShape,
    scale_factor: f64,
    reals: Vec<Tensor>,
    levels: Vec<FrozenLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: usize,
    shape: ModelShape,
    scale_factor: f64,
    num_reals: usize,
    levels: Vec<LevelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LevelEntry {
    index: usize,
    capacity: Capacity,
    noise_amp: f64,
}

impl TrainedPyramid {
    pub fn new(shape: ModelShape, scale_factor: f64, reals: Vec<Tensor>) -> Result<Self> {
        ensure!(!reals.is_empty(), "the real-image pyramid is empty");
        ensure!(
            scale_factor > 0.0 && scale_factor < 1.0,
            "scale_factor must be in range (0, 1), but get {}",
            scale_factor
        );
        for real in &reals {
            let (_b, c, _h, _w) = real.size4()?;
            ensure!(
                c == shape.img_channels as i64,
                "real image has {} channels, but the model expects {}",
                c,
                shape.img_channels
            );
        }

        Ok(Self {
            shape,
            scale_factor,
            reals,
            levels: vec![],
        })
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn padding(&self) -> Padding {
        Padding::new(self.shape.kernel_size, self.shape.num_layers)
    }

    pub fn reals(&self) -> &[Tensor] {
        &self.reals
    }

    pub fn levels(&self) -> &[FrozenLevel] {
        &self.levels
    }

    pub fn last_level(&self) -> Option<&FrozenLevel> {
        self.levels.last()
    }

    /// Index of the next level to train, or `None` when all levels are done.
    pub fn next_level(&self) -> Option<usize> {
        let trained = self.levels.len();
        (trained < self.reals.len()).then(|| trained)
    }

    pub fn is_complete(&self) -> bool {
        self.next_level().is_none()
    }

    pub fn push(&mut self, level: FrozenLevel) -> Result<()> {
        let index = self
            .next_level()
            .ok_or_else(|| format_err!("every pyramid level is already trained"))?;

        let expect = self.padding().pad(&self.reals[index]).size();
        ensure!(
            level.fixed_noise.size() == expect,
            "fixed noise of level {} has shape {:?}, but expect {:?}",
            index,
            level.fixed_noise.size(),
            expect
        );

        self.levels.push(level);
        Ok(())
    }

    /// Writes the tensors and the manifest into `exp_dir`.
    ///
    /// Per-level weights are expected under `{exp_dir}/{index}/` already.
    /// The manifest is written last, so a pyramid is only visible once all
    /// of its files are in place.
    pub fn save(&self, exp_dir: impl AsRef<Path>) -> Result<()> {
        let exp_dir = exp_dir.as_ref();
        fs::create_dir_all(exp_dir)?;

        for index in 0..self.levels.len() {
            let level_dir = exp_dir.join(index.to_string());
            for file in [GENERATOR_FILE, DISCRIMINATOR_FILE] {
                let path = level_dir.join(file);
                ensure!(
                    path.is_file(),
                    "weights of level {} are missing at '{}'",
                    index,
                    path.display()
                );
            }
        }

        save_tensors(&self.reals, exp_dir.join(REALS_FILE))?;
        let fixed_noises: Vec<_> = self
            .levels
            .iter()
            .map(|level| level.fixed_noise.shallow_clone())
            .collect();
        save_tensors(&fixed_noises, exp_dir.join(FIXED_NOISES_FILE))?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            shape: self.shape,
            scale_factor: self.scale_factor,
            num_reals: self.reals.len(),
            levels: self
                .levels
                .iter()
                .enumerate()
                .map(|(index, level)| LevelEntry {
                    index,
                    capacity: level.capacity(),
                    noise_amp: level.noise_amp,
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&manifest)?;
        write_atomic(exp_dir.join(MANIFEST_FILE), text.as_bytes())?;

        Ok(())
    }

    pub fn exists(exp_dir: impl AsRef<Path>) -> bool {
        exp_dir.as_ref().join(MANIFEST_FILE).is_file()
    }

    /// Loads a pyramid written by [`TrainedPyramid::save`]. Every loaded
    /// level is sealed.
    pub fn load(exp_dir: impl AsRef<Path>, device: Device) -> Result<Self> {
        let exp_dir = exp_dir.as_ref();
        let manifest_path = exp_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path)
            .with_context(|| format!("unable to read '{}'", manifest_path.display()))?;
        let Manifest {
            version,
            shape,
            scale_factor,
            num_reals,
            levels,
        } = serde_json::from_str(&text)
            .with_context(|| format!("unable to parse '{}'", manifest_path.display()))?;
        ensure!(
            version == MANIFEST_VERSION,
            "unsupported pyramid format version {}",
            version
        );

        let reals = load_tensors(exp_dir.join(REALS_FILE), device)?;
        ensure!(
            reals.len() == num_reals,
            "expect {} real images, but found {}",
            num_reals,
            reals.len()
        );
        let fixed_noises = if levels.is_empty() {
            vec![]
        } else {
            load_tensors(exp_dir.join(FIXED_NOISES_FILE), device)?
        };
        ensure!(
            fixed_noises.len() == levels.len(),
            "expect {} fixed noises, but found {}",
            levels.len(),
            fixed_noises.len()
        );

        let mut pyramid = Self::new(shape, scale_factor, reals)?;

        for (expect_index, (entry, fixed_noise)) in izip!(levels, fixed_noises).enumerate() {
            let LevelEntry {
                index,
                capacity,
                noise_amp,
            } = entry;
            ensure!(
                index == expect_index,
                "level entries are out of order: expect {}, but get {}",
                expect_index,
                index
            );

            let mut models = ScaleModelsInit {
                shape,
                capacity,
                device,
            }
            .build()?;
            models.load(exp_dir.join(index.to_string()))?;

            let level = TrainedLevel {
                models,
                fixed_noise,
                noise_amp,
            }
            .seal();
            pyramid.push(level)?;
        }

        Ok(pyramid)
    }
}

fn save_tensors(tensors: &[Tensor], path: PathBuf) -> Result<()> {
    let names: Vec<_> = (0..tensors.len()).map(|index| index.to_string()).collect();
    let named: Vec<_> = izip!(&names, tensors)
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();

    let tmp_path = path.with_extension("ot.tmp");
    Tensor::save_multi(&named, &tmp_path)
        .with_context(|| format!("unable to write '{}'", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

fn load_tensors(path: PathBuf, device: Device) -> Result<Vec<Tensor>> {
    let named = Tensor::load_multi_with_device(&path, device)
        .with_context(|| format!("unable to read '{}'", path.display()))?;

    let mut indexed: Vec<(usize, Tensor)> = named
        .into_iter()
        .map(|(name, tensor)| -> Result<_> {
            let index: usize = name
                .parse()
                .with_context(|| format!("invalid tensor name '{}' in '{}'", name, path.display()))?;
            Ok((index, tensor))
        })
        .try_collect()?;
    indexed.sort_by_key(|(index, _)| *index);

    ensure!(
        indexed
            .iter()
            .enumerate()
            .all(|(expect, (index, _))| expect == *index),
        "tensor names in '{}' are not contiguous",
        path.display()
    );
    Ok(indexed.into_iter().map(|(_, tensor)| tensor).collect())
}

fn write_atomic(path: PathBuf, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("unable to write '{}'", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}
