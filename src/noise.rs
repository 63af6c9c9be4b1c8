use crate::common::*;

/// Border added around generator inputs so that the unpadded convolutions
/// shrink them back to the real image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    size: i64,
}

impl Padding {
    pub fn new(kernel_size: usize, num_layers: usize) -> Self {
        let size = ((kernel_size - 1) * num_layers / 2) as i64;
        Self { size }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Zero pads all four sides of a `[B, C, H, W]` tensor.
    pub fn pad(&self, xs: &Tensor) -> Tensor {
        let size = self.size;
        xs.zero_pad2d(size, size, size, size)
    }

    /// Spatial size of a padded tensor with the border removed.
    pub fn inner_size(&self, padded: &Tensor) -> Result<(i64, i64)> {
        let (_b, _c, h, w) = padded.size4()?;
        let size = self.size;
        ensure!(
            h > 2 * size && w > 2 * size,
            "tensor of size {}x{} is smaller than the padding border {}",
            h,
            w,
            size
        );
        Ok((h - 2 * size, w - 2 * size))
    }
}

pub fn receptive_field(kernel_size: usize, num_layers: usize, stride: usize) -> usize {
    kernel_size + (kernel_size - 1) * (num_layers - 1) * stride
}

/// Draws the Gaussian noise injected at each pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct NoiseSampler {
    pub device: Device,
    pub channels: i64,
}

impl NoiseSampler {
    pub fn new(device: Device, channels: usize) -> Self {
        Self {
            device,
            channels: channels as i64,
        }
    }

    /// Unpadded noise of shape `[1, C, H, W]`.
    ///
    /// The coarsest level uses one noise channel broadcast to every image
    /// channel; deeper levels draw each channel independently.
    pub fn sample(&self, level: usize, height: i64, width: i64) -> Tensor {
        let Self { device, channels } = *self;

        if level == 0 {
            Tensor::randn(&[1, 1, height, width], (Kind::Float, device)).expand(
                &[1, channels, height, width],
                false,
            )
        } else {
            Tensor::randn(&[1, channels, height, width], (Kind::Float, device))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_adds_border() -> Result<()> {
        for (kernel_size, num_layers, expect) in [(3, 5, 5), (3, 2, 2), (4, 3, 4), (1, 5, 0)] {
            let padding = Padding::new(kernel_size, num_layers);
            ensure!(padding.size() == expect);

            let xs = Tensor::rand(&[1, 3, 7, 9], FLOAT_CPU);
            let padded = padding.pad(&xs);
            ensure!(padded.size() == vec![1, 3, 7 + 2 * expect, 9 + 2 * expect]);
            ensure!(padding.inner_size(&padded)? == (7, 9));
        }
        Ok(())
    }

    #[test]
    fn receptive_field_formula() {
        assert_eq!(receptive_field(3, 5, 1), 11);
        assert_eq!(receptive_field(3, 5, 2), 19);
    }

    #[test]
    fn coarsest_noise_is_broadcast() -> Result<()> {
        let sampler = NoiseSampler::new(Device::Cpu, 3);

        let coarse = sampler.sample(0, 5, 6);
        ensure!(coarse.size() == vec![1, 3, 5, 6]);
        ensure!(coarse.select(1, 0).equal(&coarse.select(1, 2)));

        let fine = sampler.sample(1, 5, 6);
        ensure!(fine.size() == vec![1, 3, 5, 6]);
        ensure!(!fine.select(1, 0).equal(&fine.select(1, 2)));
        Ok(())
    }
}
