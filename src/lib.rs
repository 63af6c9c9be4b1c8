pub mod common;
pub mod config;
pub mod drawer;
pub mod heatmap;
pub mod image;
pub mod inference;
pub mod logging;
pub mod lr_schedule;
pub mod message;
pub mod model;
pub mod noise;
pub mod orchestrator;
pub mod pyramid;
pub mod state;
pub mod trainer;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::common::*;

/// Trains the whole pyramid while a logging worker writes the loss scalars.
pub async fn start_training(config: config::Config) -> Result<()> {
    // data logging
    let start_time = Local::now();
    let log_dir = config
        .logging
        .exp_dir
        .join("logs")
        .join(format!("{}", start_time.format(FILE_STRFTIME)));
    tokio::fs::create_dir_all(&log_dir).await?;

    let config = Arc::new(config);
    let (log_tx, log_rx) = flume::bounded(64);

    // training worker
    let train_fut = {
        let config = config.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let pyramid = orchestrator::train_pyramid(&config, Some(&log_tx))?;
            info!("trained {} levels", pyramid.levels().len());
            Ok(())
        })
        .map(|result| Fallible::Ok(result??))
    };

    let log_fut = tokio::task::spawn(logging::logging_worker(log_dir, log_rx))
        .map(|result| Fallible::Ok(result??));

    // run all tasks
    futures::try_join!(train_fut, log_fut)?;

    Ok(())
}

/// Samples a trained pyramid, or continues it to super resolution.
pub async fn start_inference(config: config::Config, mode: InferenceMode) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let sample = match mode {
            InferenceMode::Sample { start_image } => {
                inference::run_inference(&config, start_image.as_deref())?
            }
            InferenceMode::SuperResolution { input } => {
                inference::run_super_resolution(&config, input.as_deref())?
            }
        };
        info!(
            "outputs are written to '{}', last sample size {:?}",
            config.inference.infer_dir.display(),
            sample.size()
        );
        Ok(())
    })
    .await??;

    Ok(())
}

#[derive(Debug, Clone)]
pub enum InferenceMode {
    Sample { start_image: Option<PathBuf> },
    SuperResolution { input: Option<PathBuf> },
}
