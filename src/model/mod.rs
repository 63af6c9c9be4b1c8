mod acm;
mod conv_block;
mod discriminator;
mod generator;
mod loss;

pub use acm::*;
pub use conv_block::*;
pub use discriminator::*;
pub use generator::*;
pub use loss::*;

use crate::{common::*, config};

pub const GENERATOR_FILE: &str = "generator.ot";
pub const DISCRIMINATOR_FILE: &str = "discriminator.ot";

/// Channel counts of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub nfc: usize,
    pub min_nfc: usize,
}

/// Architecture parameters shared by every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub img_channels: usize,
    pub kernel_size: usize,
    pub num_layers: usize,
    pub stride: usize,
    pub num_heads: usize,
}

impl ModelShape {
    pub fn from_config(config: &config::Config) -> Self {
        let config::Model {
            kernel_size,
            num_layers,
            stride,
            num_heads,
            ..
        } = config.model;

        Self {
            img_channels: config.input.img_channels.get(),
            kernel_size: kernel_size.get(),
            num_layers: num_layers.get(),
            stride: stride.get(),
            num_heads: num_heads.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScaleModelsInit {
    pub shape: ModelShape,
    pub capacity: Capacity,
    pub device: Device,
}

impl ScaleModelsInit {
    pub fn build(self) -> Result<ScaleModels> {
        let Self {
            shape,
            capacity,
            device,
        } = self;

        let generator_vs = nn::VarStore::new(device);
        let generator = GeneratorInit { shape, capacity }.build(&generator_vs.root() / "generator")?;

        let discriminator_vs = nn::VarStore::new(device);
        let discriminator =
            DiscriminatorInit { shape, capacity }.build(&discriminator_vs.root() / "discriminator")?;

        Ok(ScaleModels {
            capacity,
            generator_vs,
            generator,
            discriminator_vs,
            discriminator,
        })
    }
}

/// The generator and discriminator of one level with their variable stores.
#[derive(Debug)]
pub struct ScaleModels {
    pub capacity: Capacity,
    pub generator_vs: nn::VarStore,
    pub generator: Generator,
    pub discriminator_vs: nn::VarStore,
    pub discriminator: Discriminator,
}

impl ScaleModels {
    /// Loads pretrained weights into whichever network has a path.
    pub fn load_pretrained(
        &mut self,
        generator_path: Option<&Path>,
        discriminator_path: Option<&Path>,
    ) -> Result<()> {
        if let Some(path) = generator_path {
            self.generator_vs.load(path).with_context(|| {
                format!("unable to load generator weights '{}'", path.display())
            })?;
        }
        if let Some(path) = discriminator_path {
            self.discriminator_vs.load(path).with_context(|| {
                format!("unable to load discriminator weights '{}'", path.display())
            })?;
        }
        Ok(())
    }

    /// Copies all weights and batch norm statistics from a level with the
    /// same capacity.
    pub fn copy_from(&mut self, other: &ScaleModels) -> Result<()> {
        ensure!(
            self.capacity == other.capacity,
            "cannot copy weights across capacities {:?} and {:?}",
            other.capacity,
            self.capacity
        );
        self.generator_vs.copy(&other.generator_vs)?;
        self.discriminator_vs.copy(&other.discriminator_vs)?;
        Ok(())
    }

    /// Writes `generator.ot` and `discriminator.ot` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        save_var_store(&self.generator_vs, dir.join(GENERATOR_FILE))?;
        save_var_store(&self.discriminator_vs, dir.join(DISCRIMINATOR_FILE))?;
        Ok(())
    }

    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.load_pretrained(
            Some(&dir.join(GENERATOR_FILE)),
            Some(&dir.join(DISCRIMINATOR_FILE)),
        )
    }

    pub fn freeze(&mut self) {
        self.generator_vs.freeze();
        self.discriminator_vs.freeze();
    }
}

fn save_var_store(vs: &nn::VarStore, path: PathBuf) -> Result<()> {
    let tmp_path = path.with_extension("ot.tmp");
    vs.save(&tmp_path)
        .with_context(|| format!("unable to save weights to '{}'", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}
