use crate::{
    common::*,
    config,
    heatmap::HeatmapPool,
    image, message as msg,
    model::{ModelShape, ScaleModels, ScaleModelsInit},
    noise, pyramid,
    state::TrainedPyramid,
    trainer::ScaleTrainer,
};

const TRAIN_HEATMAP_WORKERS: usize = 4;

/// Seeds the torch generator and returns the seed in use.
pub fn seed_rng(seed: Option<i64>) -> i64 {
    let seed = seed.unwrap_or_else(|| rand::random::<u32>() as i64);
    tch::manual_seed(seed);
    seed
}

/// Trains every level of the pyramid in order, persisting the whole
/// pyramid after each one.
pub fn train_pyramid(
    config: &config::Config,
    log_tx: Option<&flume::Sender<msg::LogMessage>>,
) -> Result<TrainedPyramid> {
    let device = config.train.device;
    let channels = config.input.img_channels.get();
    let exp_dir = &config.logging.exp_dir;
    let shape = ModelShape::from_config(config);

    let seed = seed_rng(config.train.seed);
    info!("random seed = {}", seed);

    let source = image::read_image(&config.input.image_path, channels, device)?;
    let (schedule, reals) = pyramid::prepare_reals(&source, &config.pyramid, channels)?;
    let receptive_field = noise::receptive_field(shape.kernel_size, shape.num_layers, shape.stride);
    info!(
        "{} levels, scale factor = {:.4}, receptive field = {}",
        schedule.num_levels(),
        schedule.scale_factor,
        receptive_field
    );
    pyramid::ensure_min_level_size(&reals, receptive_field)?;

    let mut pyramid = if config.logging.resume && TrainedPyramid::exists(exp_dir) {
        let loaded = TrainedPyramid::load(exp_dir, device)?;
        check_resumable(&loaded, &shape, &reals)?;
        info!(
            "resume from '{}' with {} trained levels",
            exp_dir.display(),
            loaded.levels().len()
        );
        loaded
    } else {
        TrainedPyramid::new(shape, schedule.scale_factor, reals)?
    };

    while let Some(level) = pyramid.next_level() {
        let span = info_span!("scale", level);
        let _enter = span.enter();

        let level_dir = exp_dir.join(level.to_string());
        fs::create_dir_all(&level_dir)?;
        image::save_image(&pyramid.reals()[level], level_dir.join("real_scale.png"))?;

        let models = build_level_models(config, &pyramid)?;
        let heatmaps = config
            .logging
            .save_attention_map
            .then(|| HeatmapPool::new(TRAIN_HEATMAP_WORKERS));

        let trained = ScaleTrainer {
            config,
            pyramid: &pyramid,
            log_tx,
            heatmaps: heatmaps.as_ref(),
        }
        .train(models)?;

        if let Some(heatmaps) = heatmaps {
            heatmaps.finish()?;
        }

        pyramid.push(trained.seal())?;
        pyramid.save(exp_dir)?;
        info!("level {} is done", level);
    }

    Ok(pyramid)
}

/// Builds the networks of the next level.
///
/// Pretrained weights are loaded first. When the capacity equals the
/// previous level's, its weights are copied over.
pub fn build_level_models(config: &config::Config, pyramid: &TrainedPyramid) -> Result<ScaleModels> {
    let level = pyramid
        .next_level()
        .ok_or_else(|| format_err!("every pyramid level is already trained"))?;
    let capacity = config.model.capacity.at(level);

    let mut models = ScaleModelsInit {
        shape: *pyramid.shape(),
        capacity,
        device: config.train.device,
    }
    .build()?;
    models.load_pretrained(
        config.model.generator_path.as_deref(),
        config.model.discriminator_path.as_deref(),
    )?;

    if let Some(prev) = pyramid.last_level() {
        if prev.capacity() == capacity {
            models.copy_from(prev.models())?;
            debug!("warm start from level {}", level - 1);
        }
    }

    Ok(models)
}

fn check_resumable(loaded: &TrainedPyramid, shape: &ModelShape, reals: &[Tensor]) -> Result<()> {
    ensure!(
        loaded.shape() == shape,
        "the persisted model shape {:?} differs from the configured {:?}",
        loaded.shape(),
        shape
    );
    ensure!(
        loaded.reals().len() == reals.len(),
        "the persisted pyramid has {} levels, but the configuration yields {}",
        loaded.reals().len(),
        reals.len()
    );
    let all_equal = izip!(loaded.reals(), reals).all(|(lhs, rhs)| {
        lhs.size() == rhs.size() && lhs.to_device(Device::Cpu).equal(&rhs.to_device(Device::Cpu))
    });
    ensure!(
        all_equal,
        "the persisted real images differ from the current input image"
    );
    Ok(())
}
