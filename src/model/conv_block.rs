use crate::common::*;

pub(crate) const LEAKY_SLOPE: f64 = 0.2;

/// Convolution weights are drawn from N(0, 0.02) and biases start at zero.
pub(crate) fn conv_config(stride: usize, groups: usize) -> nn::ConvConfig {
    nn::ConvConfig {
        stride: stride as i64,
        padding: 0,
        groups: groups as i64,
        ws_init: nn::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
        bs_init: nn::Init::Const(0.0),
        ..Default::default()
    }
}

pub(crate) fn leaky_relu(xs: &Tensor, slope: f64) -> Tensor {
    xs.clamp_min(0.0) + xs.clamp_max(0.0) * slope
}

#[derive(Debug, Clone)]
pub struct ConvBlockInit {
    pub ksize: usize,
    pub stride: usize,
}

impl ConvBlockInit {
    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> ConvBlock {
        let path = path.borrow();
        let Self { ksize, stride } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_dim as i64,
            out_dim as i64,
            ksize as i64,
            conv_config(stride, 1),
        );
        let bn = nn::batch_norm2d(
            path / "bn",
            out_dim as i64,
            nn::BatchNormConfig {
                ws_init: nn::Init::Randn {
                    mean: 1.0,
                    stdev: 0.02,
                },
                bs_init: nn::Init::Const(0.0),
                ..Default::default()
            },
        );

        ConvBlock { conv, bn }
    }
}

/// Unpadded convolution, batch norm and leaky ReLU.
#[derive(Debug)]
pub struct ConvBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl nn::ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply(&self.conv).apply_t(&self.bn, train);
        leaky_relu(&xs, LEAKY_SLOPE)
    }
}

/// Input and output channels of the body blocks shared by the generator
/// and the discriminator, followed by the channel count fed to the tail.
///
/// Block `i` halves the width to `nfc / 2^(i+1)`, never going below
/// `min_nfc`.
pub(crate) fn body_channels(
    nfc: usize,
    min_nfc: usize,
    num_layers: usize,
) -> (Vec<(usize, usize)>, usize) {
    let num_blocks = num_layers.saturating_sub(2);

    let mut in_dim = nfc;
    let blocks: Vec<_> = (0..num_blocks)
        .map(|index| {
            let out_dim = (nfc >> (index + 1)).max(min_nfc);
            let dims = (in_dim, out_dim);
            in_dim = out_dim;
            dims
        })
        .collect();

    (blocks, in_dim.max(min_nfc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_block_shrinks_by_kernel() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ConvBlockInit { ksize: 3, stride: 1 }.build(&vs.root(), 3, 8);

        let xs = Tensor::randn(&[1, 3, 9, 11], FLOAT_CPU);
        let ys = block.forward_t(&xs, true);
        ensure!(ys.size() == vec![1, 8, 7, 9]);
        Ok(())
    }

    #[test]
    fn body_channels_halve_to_minimum() {
        let (blocks, tail) = body_channels(32, 8, 5);
        assert_eq!(blocks, vec![(32, 16), (16, 8), (8, 8)]);
        assert_eq!(tail, 8);

        let (blocks, tail) = body_channels(8, 8, 2);
        assert!(blocks.is_empty());
        assert_eq!(tail, 8);
    }

    #[test]
    fn leaky_relu_keeps_slope() -> Result<()> {
        let xs = Tensor::of_slice(&[-1.0f32, 0.0, 2.0]);
        let ys = leaky_relu(&xs, 0.2);
        ensure!(ys.allclose(&Tensor::of_slice(&[-0.2f32, 0.0, 2.0]), 1e-6, 1e-6, false));
        Ok(())
    }
}
