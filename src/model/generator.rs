use super::{
    conv_block::{body_channels, conv_config, ConvBlock, ConvBlockInit},
    Capacity, ModelShape,
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub shape: ModelShape,
    pub capacity: Capacity,
}

impl GeneratorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator> {
        let path = path.borrow();
        let Self {
            shape:
                ModelShape {
                    img_channels,
                    kernel_size,
                    num_layers,
                    stride,
                    ..
                },
            capacity: Capacity { nfc, min_nfc },
        } = self;
        ensure!(num_layers >= 2, "the generator needs at least 2 layers");

        let block_init = ConvBlockInit {
            ksize: kernel_size,
            stride,
        };
        let head = block_init.clone().build(path / "head", img_channels, nfc);

        let (body_dims, tail_dim) = body_channels(nfc, min_nfc, num_layers);
        let body: Vec<_> = body_dims
            .into_iter()
            .enumerate()
            .map(|(index, (in_dim, out_dim))| {
                block_init
                    .clone()
                    .build(path / format!("body_{}", index), in_dim, out_dim)
            })
            .collect();

        let tail = nn::conv2d(
            path / "tail",
            tail_dim as i64,
            img_channels as i64,
            kernel_size as i64,
            conv_config(stride, 1),
        );

        Ok(Generator { head, body, tail })
    }
}

/// Single-scale generator.
///
/// Maps a padded noisy input to a residual that is added to the center of
/// the padded conditioning image, producing an image of the unpadded size.
#[derive(Debug)]
pub struct Generator {
    head: ConvBlock,
    body: Vec<ConvBlock>,
    tail: nn::Conv2D,
}

impl Generator {
    pub fn forward_t(&self, noisy_input: &Tensor, prev: &Tensor, train: bool) -> Result<Tensor> {
        let Self { head, body, tail } = self;

        let xs = body
            .iter()
            .fold(noisy_input.apply_t(head, train), |xs, block| {
                xs.apply_t(block, train)
            })
            .apply(tail)
            .tanh();

        let (_, _, out_h, out_w) = xs.size4()?;
        let (_, _, prev_h, prev_w) = prev.size4()?;
        ensure!(
            prev_h >= out_h && prev_w >= out_w,
            "conditioning image {}x{} is smaller than the generated image {}x{}",
            prev_h,
            prev_w,
            out_h,
            out_w
        );
        let top = (prev_h - out_h) / 2;
        let left = (prev_w - out_w) / 2;
        let prev = prev.narrow(2, top, out_h).narrow(3, left, out_w);

        Ok(xs + prev)
    }
}
