use crate::{
    common::*,
    config,
    heatmap::{HeatmapPool, HeatmapTask},
    image,
    model::DiscriminatorOutput,
    noise::{self, NoiseSampler, Padding},
    state::{FrozenLevel, TrainedPyramid},
};

const INFER_HEATMAP_WORKERS: usize = 2;

/// One generation step of an inference plan.
#[derive(Debug)]
pub struct Stage<'a> {
    pub level: &'a FrozenLevel,
    /// Padded seed used in place of random noise when fixed noise is on.
    pub fixed_noise: Tensor,
}

/// The sequence of frozen generators an inference run goes through.
#[derive(Debug)]
pub struct InferencePlan<'a> {
    stages: Vec<Stage<'a>>,
    scale_factor: f64,
    padding: Padding,
    channels: usize,
    receptive_field: i64,
    super_resolution: bool,
}

impl<'a> InferencePlan<'a> {
    /// Runs every trained level once.
    pub fn from_pyramid(pyramid: &'a TrainedPyramid) -> Result<Self> {
        ensure!(
            !pyramid.levels().is_empty(),
            "the pyramid has no trained level"
        );
        if !pyramid.is_complete() {
            warn!(
                "only {} of {} levels are trained",
                pyramid.levels().len(),
                pyramid.reals().len()
            );
        }

        let stages = pyramid
            .levels()
            .iter()
            .map(|level| Stage {
                level,
                fixed_noise: level.fixed_noise().shallow_clone(),
            })
            .collect();

        Ok(Self {
            stages,
            scale_factor: pyramid.scale_factor(),
            padding: pyramid.padding(),
            channels: pyramid.shape().img_channels,
            receptive_field: receptive_field(pyramid),
            super_resolution: false,
        })
    }

    /// Re-applies the finest level `iterations` times, each stage enlarging
    /// the image by `1 / scale_factor`.
    ///
    /// Returns the plan with the upsampled real images, one per stage.
    pub fn super_resolution(
        pyramid: &'a TrainedPyramid,
        real: &Tensor,
        iterations: usize,
    ) -> Result<(Self, Vec<Tensor>)> {
        let finest = pyramid
            .last_level()
            .ok_or_else(|| format_err!("the pyramid has no trained level"))?;
        let padding = pyramid.padding();
        let upscale = 1.0 / pyramid.scale_factor();

        let reals: Vec<Tensor> = tch::no_grad(|| {
            iter::successors(Some(image::resize(real, upscale)), |prev| {
                prev.as_ref().ok().map(|prev| image::resize(prev, upscale))
            })
            .take(iterations)
            .try_collect()
        })?;

        let stages = reals
            .iter()
            .map(|real| Stage {
                level: finest,
                fixed_noise: padding.pad(&real.zeros_like()),
            })
            .collect();

        let plan = Self {
            stages,
            scale_factor: pyramid.scale_factor(),
            padding,
            channels: pyramid.shape().img_channels,
            receptive_field: receptive_field(pyramid),
            super_resolution: true,
        };
        Ok((plan, reals))
    }

    pub fn stages(&self) -> &[Stage<'a>] {
        &self.stages
    }

    /// Generates `num_samples` images through every stage and returns the
    /// samples of the last stage.
    pub fn sample_all(
        &self,
        config: &config::Inference,
        start_image: Option<&Tensor>,
        heatmaps: Option<&HeatmapPool>,
    ) -> Result<Vec<Tensor>> {
        let config::Inference {
            ref infer_dir,
            num_samples,
            scale_h,
            scale_w,
            gen_start_scale,
            use_fixed_noise,
            save_all_pyramid,
            ..
        } = *config;
        let Self {
            ref stages,
            scale_factor,
            padding,
            channels,
            receptive_field,
            super_resolution,
        } = *self;
        let num_stages = stages.len();
        let attention_dir = infer_dir.join("attention");
        fs::create_dir_all(infer_dir)
            .with_context(|| format!("unable to create '{}'", infer_dir.display()))?;

        tch::no_grad(|| {
            stages
                .iter()
                .enumerate()
                .try_fold(vec![], |prev_images: Vec<Tensor>, (idx, stage)| {
                    let device = stage.fixed_noise.device();
                    let sampler = NoiseSampler::new(device, channels);
                    let (real_h, real_w) = padding.inner_size(&stage.fixed_noise)?;
                    let out_h = (real_h as f64 * scale_h.raw()).round() as i64;
                    let out_w = (real_w as f64 * scale_w.raw()).round() as i64;
                    ensure!(
                        out_h.min(out_w) >= receptive_field,
                        "stage {} has output size {}x{}, smaller than the receptive field {}",
                        idx,
                        out_h,
                        out_w,
                        receptive_field
                    );

                    (0..num_samples.get())
                        .map(|sample| -> Result<_> {
                            let padded_noise = if use_fixed_noise && idx < gen_start_scale {
                                resized_seed(&stage.fixed_noise, padding, out_h, out_w)?
                            } else {
                                padding.pad(&sampler.sample(idx, out_h, out_w))
                            };
                            let (_, _, noise_h, noise_w) = padded_noise.size4()?;

                            let padded_img = match prev_images.get(sample) {
                                None => {
                                    let start = match start_image {
                                        Some(start) => image::resize_to(start, out_h, out_w)?,
                                        None => Tensor::zeros(
                                            &[1, channels as i64, out_h, out_w],
                                            (Kind::Float, device),
                                        ),
                                    };
                                    padding.pad(&start)
                                }
                                Some(prev) => {
                                    let upscaled = image::resize(prev, 1.0 / scale_factor)?;
                                    let padded = if super_resolution {
                                        padding.pad(&upscaled)
                                    } else {
                                        let cropped = crop_at_most(&upscaled, out_h, out_w)?;
                                        crop_at_most(&padding.pad(&cropped), noise_h, noise_w)?
                                    };
                                    image::resize_to(&padded, noise_h, noise_w)?
                                }
                            };

                            let noisy_input = padded_noise * stage.level.noise_amp() + &padded_img;
                            let generated = stage.level.generate(&noisy_input, &padded_img)?;

                            let name = if save_all_pyramid {
                                Some(format!("{}_{}", sample, idx))
                            } else if idx + 1 == num_stages {
                                Some(sample.to_string())
                            } else {
                                None
                            };
                            if let Some(name) = name {
                                image::save_image(&generated, infer_dir.join(format!("{}.png", name)))?;

                                if let Some(heatmaps) = heatmaps {
                                    let DiscriminatorOutput {
                                        add_attention,
                                        sub_attention,
                                        ..
                                    } = stage.level.discriminate(&generated)?;
                                    let label = format!("{}_{}thG", sample, idx);

                                    heatmaps.submit(HeatmapTask::new(
                                        &generated,
                                        &add_attention,
                                        &attention_dir,
                                        format!("{}_infer_add", label),
                                    )?)?;
                                    heatmaps.submit(HeatmapTask::new(
                                        &generated,
                                        &sub_attention,
                                        &attention_dir,
                                        format!("{}_infer_sub", label),
                                    )?)?;
                                }
                            }

                            Ok(generated)
                        })
                        .try_collect()
                })
        })
    }

    /// Generates samples and returns the last one.
    pub fn generate(
        &self,
        config: &config::Inference,
        start_image: Option<&Tensor>,
        heatmaps: Option<&HeatmapPool>,
    ) -> Result<Tensor> {
        let mut samples = self.sample_all(config, start_image, heatmaps)?;
        let last = samples
            .pop()
            .ok_or_else(|| format_err!("no sample was generated"))?;
        Ok(last.detach())
    }
}

fn receptive_field(pyramid: &TrainedPyramid) -> i64 {
    let shape = pyramid.shape();
    noise::receptive_field(shape.kernel_size, shape.num_layers, shape.stride) as i64
}

/// The fixed seed of a stage at another output size. The interior is
/// resized and padded again.
fn resized_seed(fixed_noise: &Tensor, padding: Padding, height: i64, width: i64) -> Result<Tensor> {
    let (inner_h, inner_w) = padding.inner_size(fixed_noise)?;
    if (inner_h, inner_w) == (height, width) {
        return Ok(fixed_noise.shallow_clone());
    }

    let border = padding.size();
    let inner = fixed_noise
        .narrow(2, border, inner_h)
        .narrow(3, border, inner_w);
    Ok(padding.pad(&image::resize_to(&inner, height, width)?))
}

/// Top-left crop that keeps the input size along axes already smaller
/// than the target.
fn crop_at_most(image: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    let (_, _, in_h, in_w) = image.size4()?;
    image::crop_to(image, height.min(in_h), width.min(in_w))
}

/// Samples a trained pyramid as configured.
pub fn run_inference(config: &config::Config, start_image: Option<&Path>) -> Result<Tensor> {
    let device = config.train.device;
    let pyramid = TrainedPyramid::load(&config.logging.exp_dir, device)?;
    let plan = InferencePlan::from_pyramid(&pyramid)?;

    let start_image = start_image
        .map(|path| image::read_image(path, config.input.img_channels.get(), device))
        .transpose()?;
    let heatmaps = config
        .inference
        .save_attention_map
        .then(|| HeatmapPool::new(INFER_HEATMAP_WORKERS));

    info!(
        "generate {} samples through {} levels",
        config.inference.num_samples,
        plan.stages().len()
    );
    let sample = plan.generate(&config.inference, start_image.as_ref(), heatmaps.as_ref())?;

    if let Some(heatmaps) = heatmaps {
        heatmaps.finish()?;
    }
    Ok(sample)
}

/// Enlarges an image beyond the training resolution with the finest level.
///
/// Uses `input` when given, otherwise the finest real image of the pyramid.
pub fn run_super_resolution(config: &config::Config, input: Option<&Path>) -> Result<Tensor> {
    let device = config.train.device;
    let infer_dir = &config.inference.infer_dir;
    let pyramid = TrainedPyramid::load(&config.logging.exp_dir, device)?;

    let real = match input {
        Some(path) => image::read_image(path, config.input.img_channels.get(), device)?,
        None => pyramid
            .reals()
            .last()
            .ok_or_else(|| format_err!("the pyramid has no real image"))?
            .shallow_clone(),
    };
    let (plan, reals) =
        InferencePlan::super_resolution(&pyramid, &real, config.inference.sr_iterations.get())?;

    fs::create_dir_all(infer_dir)?;
    for (index, real) in reals.iter().enumerate() {
        image::save_image(real, infer_dir.join(format!("{}_real.png", index)))?;
    }

    let heatmaps = config
        .inference
        .save_attention_map
        .then(|| HeatmapPool::new(INFER_HEATMAP_WORKERS));
    let sample = plan.generate(&config.inference, reals.first(), heatmaps.as_ref())?;

    if let Some(heatmaps) = heatmaps {
        heatmaps.finish()?;
    }
    info!("super resolution output size {:?}", sample.size());
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::tests::tiny_config, state::tests::tiny_pyramid};

    fn image_names(dir: &Path) -> Result<Vec<String>> {
        let mut names: Vec<_> = fs::read_dir(dir)?
            .map(|entry| -> Result<_> { Ok(entry?.file_name().to_string_lossy().into_owned()) })
            .filter_ok(|name| name.ends_with(".png"))
            .try_collect()?;
        names.sort();
        Ok(names)
    }

    #[test]
    fn saves_every_level() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config(dir.path());
        let pyramid = tiny_pyramid(3)?;

        let plan = InferencePlan::from_pyramid(&pyramid)?;
        let sample = plan.generate(&config.inference, None, None)?;
        ensure!(sample.size() == vec![1, 3, 8, 8]);

        let names = image_names(&config.inference.infer_dir)?;
        ensure!(names == vec!["0_0.png", "0_1.png", "0_2.png", "1_0.png", "1_1.png", "1_2.png"]);
        Ok(())
    }

    #[test]
    fn saves_finest_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        config.inference.save_all_pyramid = false;
        let pyramid = tiny_pyramid(3)?;

        InferencePlan::from_pyramid(&pyramid)?.generate(&config.inference, None, None)?;
        ensure!(image_names(&config.inference.infer_dir)? == vec!["0.png", "1.png"]);
        Ok(())
    }

    #[test]
    fn fixed_noise_repeats_samples() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        let pyramid = tiny_pyramid(3)?;
        let plan = InferencePlan::from_pyramid(&pyramid)?;

        config.inference.use_fixed_noise = true;
        config.inference.gen_start_scale = 3;
        let samples = plan.sample_all(&config.inference, None, None)?;
        ensure!(samples[0].equal(&samples[1]));

        config.inference.use_fixed_noise = false;
        let samples = plan.sample_all(&config.inference, None, None)?;
        ensure!(!samples[0].equal(&samples[1]));
        Ok(())
    }

    #[test]
    fn scaled_output_with_fixed_noise() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        config.inference.scale_h = r64(2.0);
        config.inference.scale_w = r64(1.5);
        config.inference.use_fixed_noise = true;
        config.inference.gen_start_scale = 1;
        let pyramid = tiny_pyramid(3)?;

        let sample = InferencePlan::from_pyramid(&pyramid)?.generate(&config.inference, None, None)?;
        ensure!(sample.size() == vec![1, 3, 16, 12]);
        Ok(())
    }

    #[test]
    fn rejects_outputs_below_receptive_field() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        let pyramid = tiny_pyramid(3)?;
        let plan = InferencePlan::from_pyramid(&pyramid)?;

        // the 5x5 coarsest level shrinks to 3x5 under a receptive field of 5
        config.inference.scale_h = r64(0.5);
        ensure!(plan.generate(&config.inference, None, None).is_err());

        config.inference.scale_h = r64(1.0);
        ensure!(plan.generate(&config.inference, None, None).is_ok());
        Ok(())
    }

    #[test]
    fn super_resolution_reuses_finest_level() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        config.inference.save_all_pyramid = false;
        let pyramid = tiny_pyramid(3)?;
        let real = pyramid.reals()[2].shallow_clone();

        let (plan, reals) = InferencePlan::super_resolution(&pyramid, &real, 2)?;
        ensure!(plan.stages().len() == 2);
        ensure!(reals[0].size() == vec![1, 3, 11, 11]);
        ensure!(reals[1].size() == vec![1, 3, 15, 15]);

        let finest = pyramid.last_level().unwrap();
        ensure!(plan
            .stages()
            .iter()
            .all(|stage| std::ptr::eq(stage.level, finest)));

        let sample = plan.generate(&config.inference, reals.first(), None)?;
        ensure!(sample.size() == vec![1, 3, 15, 15]);
        Ok(())
    }
}
