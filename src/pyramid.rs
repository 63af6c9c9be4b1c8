use crate::{common::*, config, image};

/// Resolution schedule of the real-image pyramid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleSchedule {
    /// Factor applied to the source image before building the pyramid.
    pub scale1: f64,
    /// Ratio between the sizes of two successive levels.
    pub scale_factor: f64,
    /// Index of the finest level.
    pub stop_scale: usize,
}

impl ScaleSchedule {
    /// Derives the schedule for a source image of size `height` x `width`.
    pub fn new(height: i64, width: i64, config: &config::Pyramid) -> Result<Self> {
        let config::Pyramid {
            scale_factor,
            stop_scale,
            min_size,
            max_size,
        } = *config;
        let scale_factor = scale_factor.raw();
        let min_size = min_size.get() as f64;
        let max_size = max_size.get() as f64;

        ensure!(
            scale_factor > 0.0 && scale_factor < 1.0,
            "scale_factor must be in range (0, 1), but get {}",
            scale_factor
        );

        let short_side = height.min(width) as f64;
        let long_side = height.max(width) as f64;
        ensure!(
            short_side >= min_size,
            "the source image {}x{} is smaller than min_size {}",
            height,
            width,
            min_size
        );

        let scale1 = (max_size / long_side).min(1.0);

        let schedule = match stop_scale {
            Some(stop_scale) => Self {
                scale1,
                scale_factor,
                stop_scale,
            },
            None => {
                let num_scales = ((min_size / short_side).ln() / scale_factor.ln()).ceil() + 1.0;
                let scale2stop =
                    ((max_size.min(long_side) / long_side).ln() / scale_factor.ln()).ceil();
                let stop_scale = num_scales - scale2stop;
                ensure!(
                    stop_scale >= 1.0,
                    "the source image {}x{} is too small to build a pyramid",
                    height,
                    width
                );

                let resized_short = image::scaled_len(height.min(width), scale1) as f64;
                let scale_factor = (min_size / resized_short).powf(1.0 / stop_scale);

                Self {
                    scale1,
                    scale_factor,
                    stop_scale: stop_scale as usize,
                }
            }
        };

        let coarsest = image::scaled_len(
            image::scaled_len(height.min(width), scale1),
            schedule.level_scale(0),
        );
        ensure!(
            coarsest > 0,
            "the coarsest pyramid level of a {}x{} image is empty",
            height,
            width
        );

        Ok(schedule)
    }

    pub fn num_levels(&self) -> usize {
        self.stop_scale + 1
    }

    /// Scale of level `level` relative to the resized source image.
    pub fn level_scale(&self, level: usize) -> f64 {
        self.scale_factor.powi((self.stop_scale - level) as i32)
    }
}

/// Builds the real-image pyramid, coarsest first.
///
/// Every level is resized from `source` itself rather than from its
/// neighbour, so interpolation error does not accumulate.
pub fn build_reals(source: &Tensor, schedule: &ScaleSchedule, channels: usize) -> Result<Vec<Tensor>> {
    tch::no_grad(|| {
        let (_b, in_c, _h, _w) = source.size4()?;
        ensure!(
            in_c >= channels as i64,
            "source has {} channels, but {} are required",
            in_c,
            channels
        );
        let source = source.narrow(1, 0, channels as i64);

        (0..schedule.num_levels())
            .map(|level| image::resize(&source, schedule.level_scale(level)))
            .try_collect()
    })
}

/// Resizes the source by `scale1` and builds its pyramid.
pub fn prepare_reals(
    source: &Tensor,
    config: &config::Pyramid,
    channels: usize,
) -> Result<(ScaleSchedule, Vec<Tensor>)> {
    let (_b, _c, height, width) = source.size4()?;
    let schedule = ScaleSchedule::new(height, width, config)?;
    let source = tch::no_grad(|| image::resize(source, schedule.scale1))?;
    let reals = build_reals(&source, &schedule, channels)?;
    Ok((schedule, reals))
}

/// Fails when a level is smaller than `min_len` along either side.
///
/// Levels below the receptive field of the networks would shrink to an
/// empty feature map inside the discriminator.
pub fn ensure_min_level_size(reals: &[Tensor], min_len: usize) -> Result<()> {
    reals.iter().enumerate().try_for_each(|(level, real)| {
        let (_b, _c, h, w) = real.size4()?;
        ensure!(
            h.min(w) >= min_len as i64,
            "level {} has size {}x{}, smaller than the receptive field {}; \
             lower stop_scale or raise min_size",
            level,
            h,
            w,
            min_len
        );
        Ok(())
    })
}
