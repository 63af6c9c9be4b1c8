use crate::{
    common::*,
    config,
    drawer::{self, DrawMode},
    heatmap::{HeatmapPool, HeatmapTask},
    image,
    lr_schedule::MultiStepLr,
    message as msg,
    model::{DiscriminatorOutput, ScaleModels, WGanGpInit},
    noise::{NoiseSampler, Padding},
    state::{TrainedLevel, TrainedPyramid},
};

/// Noise amplitude of the next level.
///
/// The coarsest level uses 1. Other levels scale the RMSE between their
/// real image and the reconstruction composed by the frozen levels.
pub fn noise_amplitude(pyramid: &TrainedPyramid, noise_amp_init: f64) -> Result<f64> {
    let level = pyramid
        .next_level()
        .ok_or_else(|| format_err!("every pyramid level is already trained"))?;
    if level == 0 {
        return Ok(1.0);
    }

    let real = &pyramid.reals()[level];
    let reconstruction = drawer::draw(pyramid, DrawMode::Reconstruction)?;
    let rmse = tch::no_grad(|| reconstruction.mse_loss(real, Reduction::Mean).sqrt());
    Ok(noise_amp_init * f64::from(&rmse))
}

/// Padded reconstruction seed of the next level.
///
/// The coarsest level gets single-channel noise broadcast over all
/// channels. Deeper levels use zeros.
pub fn fixed_noise_seed(
    pyramid: &TrainedPyramid,
    sampler: &NoiseSampler,
    padding: Padding,
) -> Result<Tensor> {
    let level = pyramid
        .next_level()
        .ok_or_else(|| format_err!("every pyramid level is already trained"))?;
    let real = &pyramid.reals()[level];
    let (_, _, real_h, real_w) = real.size4()?;

    let seed = if level == 0 {
        sampler.sample(0, real_h, real_w)
    } else {
        real.zeros_like()
    };
    Ok(padding.pad(&seed))
}

/// Random noise drawn once per iteration and shared by all of its
/// sub-steps.
struct IterationNoise {
    padded_noise: Tensor,
    noise_amp: f64,
    padding: Padding,
}

impl IterationNoise {
    fn draw(
        sampler: &NoiseSampler,
        padding: Padding,
        level: usize,
        height: i64,
        width: i64,
        noise_amp: f64,
    ) -> Self {
        Self {
            padded_noise: padding.pad(&sampler.sample(level, height, width)),
            noise_amp,
            padding,
        }
    }

    /// Draws a fresh random conditioning image through the frozen levels.
    ///
    /// Returns the noisy generator input and the padded conditioning image.
    fn conditioned(
        &self,
        pyramid: &TrainedPyramid,
        sampler: &NoiseSampler,
    ) -> Result<(Tensor, Tensor)> {
        let padded_img = self
            .padding
            .pad(&drawer::draw(pyramid, DrawMode::Random(sampler))?);
        let noisy_input = (&self.padded_noise * self.noise_amp + &padded_img).detach();
        Ok((noisy_input, padded_img))
    }
}

/// Trains the next untrained level of a pyramid.
pub struct ScaleTrainer<'a> {
    pub config: &'a config::Config,
    pub pyramid: &'a TrainedPyramid,
    /// Receives one scalar map per iteration when present.
    pub log_tx: Option<&'a flume::Sender<msg::LogMessage>>,
    /// Renders attention snapshots when present.
    pub heatmaps: Option<&'a HeatmapPool>,
}

impl<'a> ScaleTrainer<'a> {
    pub fn train(&self, mut models: ScaleModels) -> Result<TrainedLevel> {
        let Self {
            config,
            pyramid,
            log_tx,
            heatmaps,
        } = *self;
        let config::Training {
            device,
            num_iter,
            n_critic,
            generator_iter,
            g_lr,
            d_lr,
            beta1,
            beta2,
            ref milestones,
            gamma,
            noise_amp_init,
            ..
        } = config.train;
        let config::Loss {
            gp_weight,
            rec_weight,
            use_acm_oth,
            acm_weight,
        } = config.loss;
        let num_iter = num_iter.get();
        let gp_weight = gp_weight.raw();
        let rec_weight = rec_weight.raw();
        let acm_weight = acm_weight.raw();

        let level = pyramid
            .next_level()
            .ok_or_else(|| format_err!("every pyramid level is already trained"))?;
        let real = &pyramid.reals()[level];
        let padding = pyramid.padding();
        let sampler = NoiseSampler::new(device, pyramid.shape().img_channels);
        let (_, _, real_h, real_w) = real.size4()?;

        let level_dir = config.logging.exp_dir.join(level.to_string());
        let attention_dir = level_dir.join("attention");
        fs::create_dir_all(&level_dir)?;

        // reconstruction path
        let noise_amp = noise_amplitude(pyramid, noise_amp_init.raw())?;
        let fixed_noise = fixed_noise_seed(pyramid, &sampler, padding)?;
        let padded_rec_img = padding.pad(&drawer::draw(pyramid, DrawMode::Reconstruction)?);
        let rec_input = (&fixed_noise * noise_amp + &padded_rec_img).detach();
        info!("noise amplitude = {:.5}", noise_amp);

        let ScaleModels {
            generator_vs,
            generator,
            discriminator_vs,
            discriminator,
            ..
        } = &mut models;

        let mut g_opt = nn::adam(beta1.raw(), beta2.raw(), 0.).build(generator_vs, g_lr.raw())?;
        let mut d_opt =
            nn::adam(beta1.raw(), beta2.raw(), 0.).build(discriminator_vs, d_lr.raw())?;
        let mut g_schedule = MultiStepLr::new(g_lr.raw(), milestones, gamma.raw())?;
        let mut d_schedule = MultiStepLr::new(d_lr.raw(), milestones, gamma.raw())?;
        let gp = WGanGpInit::default().build()?;

        let d_tag = |name: &str| format!("{}th_D/{}", level, name);
        let g_tag = |name: &str| format!("{}th_G/{}", level, name);

        for epoch in 0..num_iter {
            let mut losses = IndexMap::new();

            let noise =
                IterationNoise::draw(&sampler, padding, level, real_h, real_w, noise_amp);

            // discriminator phase
            generator_vs.freeze();
            discriminator_vs.unfreeze();

            let mut real_output = None;
            for _ in 0..n_critic.get() {
                let (noisy_input, padded_img) = noise.conditioned(pyramid, &sampler)?;

                let real_out = discriminator.forward_t(real, true)?;
                let d_real = -real_out.score.mean(Kind::Float);

                let fake = generator.forward_t(&noisy_input, &padded_img, true)?;
                let fake_out = discriminator.forward_t(&fake.detach(), true)?;
                let d_fake = fake_out.score.mean(Kind::Float);

                let penalty = gp.forward(real, &fake, |xs| {
                    Ok(discriminator.forward_t(xs, true)?.score.sum(Kind::Float))
                })?;

                let real_oth = real_out.orthogonality.mean(Kind::Float);
                let fake_oth = fake_out.orthogonality.mean(Kind::Float);

                let mut d_loss = &d_real + &d_fake + &penalty * gp_weight;
                if use_acm_oth {
                    d_loss = d_loss + (real_oth.abs() + fake_oth.abs()) * acm_weight;
                }
                d_opt.backward_step(&d_loss);

                losses.insert(d_tag("d"), f64::from(&d_loss));
                losses.insert(d_tag("d_critic"), -f64::from(&d_real) - f64::from(&d_fake));
                losses.insert(d_tag("d_gp"), f64::from(&penalty));
                if use_acm_oth {
                    losses.insert(
                        d_tag("d_oth"),
                        f64::from(&real_oth) + f64::from(&fake_oth),
                    );
                }

                real_output = Some(real_out);
            }
            losses.insert(d_tag("lr"), d_schedule.lr());

            // generator phase
            discriminator_vs.freeze();
            generator_vs.unfreeze();

            let mut fake_output = None;
            for _ in 0..generator_iter.get() {
                let (noisy_input, padded_img) = noise.conditioned(pyramid, &sampler)?;

                let fake = generator.forward_t(&noisy_input, &padded_img, true)?;
                let fake_out = discriminator.forward_t(&fake, true)?;
                let g_adv = -fake_out.score.mean(Kind::Float);

                let reconstruction = generator.forward_t(&rec_input, &padded_rec_img, true)?;
                let g_rec = reconstruction.mse_loss(real, Reduction::Mean);

                let g_loss = &g_adv + &g_rec * rec_weight;
                g_opt.backward_step(&g_loss);

                losses.insert(g_tag("g"), f64::from(&g_loss));
                losses.insert(g_tag("g_critic"), -f64::from(&g_adv));
                losses.insert(g_tag("g_rec"), f64::from(&g_rec));

                fake_output = Some((fake, fake_out));
            }
            losses.insert(g_tag("lr"), g_schedule.lr());

            let d_loss = losses.get(&d_tag("d")).copied().unwrap_or(f64::NAN);
            let g_loss = losses.get(&g_tag("g")).copied().unwrap_or(f64::NAN);
            if let Some(log_tx) = log_tx {
                log_tx
                    .send(msg::LogMessage::Scalars {
                        step: epoch,
                        scalars: losses,
                    })
                    .map_err(|_| format_err!("the logging worker has stopped"))?;
            }

            // snapshots
            let is_last = epoch + 1 == num_iter;
            if epoch % config.logging.img_save_iter.get() == 0 || is_last {
                let (fake, fake_out) = fake_output
                    .ok_or_else(|| format_err!("no generator step was run"))?;
                let real_out =
                    real_output.ok_or_else(|| format_err!("no discriminator step was run"))?;

                image::save_image(&fake, level_dir.join(format!("{}_fake_sample.png", epoch)))?;
                image::save_image(
                    &(&rec_input * 2.0 - 1.0),
                    level_dir.join(format!("{}_fixed_noise.png", epoch)),
                )?;
                let reconstruction = tch::no_grad(|| {
                    generator.forward_t(&rec_input, &padded_rec_img, true)
                })?;
                image::save_image(
                    &reconstruction,
                    level_dir.join(format!("{}_reconstruction.png", epoch)),
                )?;

                if let Some(heatmaps) = heatmaps {
                    let DiscriminatorOutput {
                        add_attention: real_add,
                        sub_attention: real_sub,
                        ..
                    } = real_out;
                    let DiscriminatorOutput {
                        add_attention: fake_add,
                        sub_attention: fake_sub,
                        ..
                    } = fake_out;

                    for (overlay, attention, name) in [
                        (real, &real_add, "real_add"),
                        (real, &real_sub, "real_sub"),
                        (&fake, &fake_add, "fake_add"),
                        (&fake, &fake_sub, "fake_sub"),
                    ] {
                        let label = format!("{}_{}", epoch, name);
                        heatmaps.submit(HeatmapTask::new(
                            overlay,
                            attention,
                            &attention_dir,
                            label,
                        )?)?;
                    }
                }

                info!(
                    "epoch {}/{}\td_loss = {:.5}\tg_loss = {:.5}\tlr = {:.6}",
                    epoch,
                    num_iter,
                    d_loss,
                    g_loss,
                    g_schedule.lr()
                );
            }

            g_opt.set_lr(g_schedule.step());
            d_opt.set_lr(d_schedule.step());
        }

        models.save(&level_dir)?;

        Ok(TrainedLevel {
            models,
            fixed_noise,
            noise_amp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::tiny_config,
        model::{Capacity, ScaleModelsInit},
        state::tests::tiny_pyramid,
    };
    use approx::assert_abs_diff_eq;

    #[test]
    fn coarsest_amplitude_is_one() -> Result<()> {
        let pyramid = tiny_pyramid(0)?;
        assert_abs_diff_eq!(noise_amplitude(&pyramid, 0.1)?, 1.0);
        Ok(())
    }

    #[test]
    fn amplitude_follows_reconstruction_error() -> Result<()> {
        let pyramid = tiny_pyramid(1)?;

        let first = noise_amplitude(&pyramid, 0.1)?;
        let second = noise_amplitude(&pyramid, 0.1)?;
        ensure!(first == second);

        let reconstruction = drawer::draw(&pyramid, DrawMode::Reconstruction)?;
        let diff = reconstruction - &pyramid.reals()[1];
        let rmse = f64::from(&(&diff * &diff).mean(Kind::Float)).sqrt();
        assert_abs_diff_eq!(first, 0.1 * rmse, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn fixed_seed_by_level() -> Result<()> {
        let sampler = NoiseSampler::new(Device::Cpu, 3);

        let pyramid = tiny_pyramid(0)?;
        let padding = pyramid.padding();
        let seed = fixed_noise_seed(&pyramid, &sampler, padding)?;
        ensure!(seed.size() == vec![1, 3, 9, 9]);
        ensure!(seed.select(1, 0).equal(&seed.select(1, 1)));

        let pyramid = tiny_pyramid(1)?;
        let seed = fixed_noise_seed(&pyramid, &sampler, padding)?;
        ensure!(seed.size() == vec![1, 3, 10, 10]);
        ensure!(f64::from(&seed.abs().sum(Kind::Float)) == 0.0);
        Ok(())
    }

    #[test]
    fn trains_one_level() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config(dir.path());
        let pyramid = tiny_pyramid(1)?;

        let models = ScaleModelsInit {
            shape: *pyramid.shape(),
            capacity: Capacity { nfc: 8, min_nfc: 8 },
            device: Device::Cpu,
        }
        .build()?;
        let (log_tx, log_rx) = flume::unbounded();

        let level = ScaleTrainer {
            config: &config,
            pyramid: &pyramid,
            log_tx: Some(&log_tx),
            heatmaps: None,
        }
        .train(models)?;

        ensure!(level.fixed_noise.size() == vec![1, 3, 10, 10]);
        ensure!(level.noise_amp >= 0.0);

        let level_dir = dir.path().join("1");
        for name in [
            "generator.ot",
            "discriminator.ot",
            "0_fake_sample.png",
            "0_fixed_noise.png",
            "0_reconstruction.png",
        ] {
            ensure!(level_dir.join(name).is_file(), "missing {}", name);
        }

        let msg::LogMessage::Scalars { step, scalars } = log_rx.try_recv()?;
        ensure!(step == 0);
        let tags: Vec<_> = scalars.keys().map(|tag| tag.as_str()).collect();
        ensure!(
            tags == vec![
                "1th_D/d",
                "1th_D/d_critic",
                "1th_D/d_gp",
                "1th_D/d_oth",
                "1th_D/lr",
                "1th_G/g",
                "1th_G/g_critic",
                "1th_G/g_rec",
                "1th_G/lr",
            ]
        );
        Ok(())
    }

    #[test]
    fn conditioning_is_redrawn_but_noise_is_shared() -> Result<()> {
        let pyramid = tiny_pyramid(2)?;
        let padding = pyramid.padding();
        let sampler = NoiseSampler::new(Device::Cpu, 3);

        let noise = IterationNoise::draw(&sampler, padding, 2, 8, 8, 0.5);
        let (first_input, first_img) = noise.conditioned(&pyramid, &sampler)?;
        let (second_input, second_img) = noise.conditioned(&pyramid, &sampler)?;
        ensure!(first_img.size() == vec![1, 3, 12, 12]);
        ensure!(!first_img.equal(&second_img));

        let expect = &noise.padded_noise * 0.5;
        ensure!((first_input - first_img).allclose(&expect, 1e-5, 1e-6, false));
        ensure!((second_input - second_img).allclose(&expect, 1e-5, 1e-6, false));

        let other = IterationNoise::draw(&sampler, padding, 2, 8, 8, 0.5);
        ensure!(!other.padded_noise.equal(&noise.padded_noise));
        Ok(())
    }

    #[test]
    fn lr_steps_once_per_iteration() -> Result<()> {
        let nz = |n: usize| NonZeroUsize::new(n).unwrap();
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path());
        config.train.num_iter = nz(3);
        config.train.n_critic = nz(2);
        config.train.generator_iter = nz(2);
        config.train.milestones = vec![1, 2];
        config.train.gamma = r64(0.1);
        config.logging.img_save_iter = nz(1);
        let pyramid = tiny_pyramid(1)?;

        let models = ScaleModelsInit {
            shape: *pyramid.shape(),
            capacity: Capacity { nfc: 8, min_nfc: 8 },
            device: Device::Cpu,
        }
        .build()?;
        let (log_tx, log_rx) = flume::unbounded();

        ScaleTrainer {
            config: &config,
            pyramid: &pyramid,
            log_tx: Some(&log_tx),
            heatmaps: None,
        }
        .train(models)?;
        drop(log_tx);

        let messages: Vec<_> = log_rx.drain().collect();
        ensure!(messages.len() == 3);
        for (epoch, message, expect_lr) in izip!(0.., messages, [5e-4, 5e-5, 5e-6]) {
            let msg::LogMessage::Scalars { step, scalars } = message;
            ensure!(step == epoch);
            assert_abs_diff_eq!(scalars["1th_D/lr"], expect_lr, epsilon = 1e-12);
            assert_abs_diff_eq!(scalars["1th_G/lr"], expect_lr, epsilon = 1e-12);
        }

        // the reconstruction input is the same fixed seed at every epoch
        let level_dir = dir.path().join("1");
        let snapshots: Vec<_> = (0..3)
            .map(|epoch| fs::read(level_dir.join(format!("{}_fixed_noise.png", epoch))))
            .try_collect()?;
        ensure!(snapshots.iter().all_equal());
        Ok(())
    }
}
