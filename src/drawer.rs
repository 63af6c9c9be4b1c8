use crate::{common::*, image, noise::NoiseSampler, state::TrainedPyramid};

/// How each frozen level obtains its noise.
#[derive(Debug, Clone, Copy)]
pub enum DrawMode<'a> {
    /// Replays the fixed reconstruction seeds.
    Reconstruction,
    /// Draws fresh noise at every level.
    Random(&'a NoiseSampler),
}

/// Composes the conditioning image for the next untrained level by running
/// every frozen generator from coarse to fine.
///
/// Starts from zeros of the coarsest real size. With no frozen level the
/// zeros are returned as is.
pub fn draw(pyramid: &TrainedPyramid, mode: DrawMode<'_>) -> Result<Tensor> {
    let reals = pyramid.reals();
    let padding = pyramid.padding();
    let upscale = 1.0 / pyramid.scale_factor();

    tch::no_grad(|| {
        let init = reals[0].zeros_like();

        izip!(pyramid.levels(), reals, &reals[1..])
            .enumerate()
            .try_fold(init, |prev, (index, (level, real, next_real))| {
                let (_, _, real_h, real_w) = real.size4()?;
                let (_, _, next_h, next_w) = next_real.size4()?;

                let prev = image::crop_to(&prev, real_h, real_w)?;
                let padded_prev = padding.pad(&prev);
                let padded_noise = match mode {
                    DrawMode::Reconstruction => level.fixed_noise().shallow_clone(),
                    DrawMode::Random(sampler) => {
                        let (h, w) = padding.inner_size(level.fixed_noise())?;
                        padding.pad(&sampler.sample(index, h, w))
                    }
                };

                let noisy_input = padded_noise * level.noise_amp() + &padded_prev;
                let generated = level.generate(&noisy_input, &padded_prev)?;
                let upscaled = image::resize(&generated, upscale)?;
                image::crop_to(&upscaled, next_h, next_w)
            })
    })
}
