use acm_singan::{common::*, config, InferenceMode};
use std::env;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Multi-scale single-image GAN with attentional discriminators.
pub struct Args {
    #[structopt(long, default_value = "config.json5")]
    pub config: PathBuf,
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Command {
    /// Train every pyramid level on the configured image.
    Train,
    /// Draw samples from a trained pyramid.
    Infer {
        /// Conditions the coarsest level on this image instead of zeros.
        #[structopt(long)]
        start_image: Option<PathBuf>,
    },
    /// Enlarge an image beyond the training resolution.
    SuperResolution {
        /// Defaults to the finest real image of the pyramid.
        #[structopt(long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        let filter = if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        };
        filter
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse config
    let Args { config, command } = Args::from_args();
    let config = config::Config::load(&config)?;

    match command {
        Command::Train => acm_singan::start_training(config).await?,
        Command::Infer { start_image } => {
            acm_singan::start_inference(config, InferenceMode::Sample { start_image }).await?
        }
        Command::SuperResolution { input } => {
            acm_singan::start_inference(config, InferenceMode::SuperResolution { input }).await?
        }
    }

    Ok(())
}
