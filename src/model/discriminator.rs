use super::{
    acm::{Acm, AcmInit, AcmOutput},
    conv_block::{body_channels, conv_config, ConvBlock, ConvBlockInit},
    Capacity, ModelShape,
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct DiscriminatorInit {
    pub shape: ModelShape,
    pub capacity: Capacity,
}

impl DiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Discriminator> {
        let path = path.borrow();
        let Self {
            shape:
                ModelShape {
                    img_channels,
                    kernel_size,
                    num_layers,
                    stride,
                    num_heads,
                },
            capacity: Capacity { nfc, min_nfc },
        } = self;
        ensure!(num_layers >= 2, "the discriminator needs at least 2 layers");

        let block_init = ConvBlockInit {
            ksize: kernel_size,
            stride,
        };
        let head = block_init.clone().build(path / "head", img_channels, nfc);
        let acm = AcmInit {
            num_heads,
            channels: nfc,
        }
        .build(path / "acm")?;

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
            1,
            kernel_size as i64,
            conv_config(stride, 1),
        );

        Ok(Discriminator {
            head,
            acm,
            body,
            tail,
        })
    }
}

#[derive(Debug)]
pub struct Discriminator {
    head: ConvBlock,
    acm: Acm,
    body: Vec<ConvBlock>,
    tail: nn::Conv2D,
}

#[derive(Debug)]
pub struct DiscriminatorOutput {
    /// Patch-wise realism scores.
    pub score: Tensor,
    pub orthogonality: Tensor,
    pub add_attention: Tensor,
    pub sub_attention: Tensor,
}

impl Discriminator {
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<DiscriminatorOutput> {
        let Self {
            head,
            acm,
            body,
            tail,
        } = self;

        let xs = input.apply_t(head, train);
        let AcmOutput {
            output: xs,
            orthogonality,
            add_attention,
            sub_attention,
        } = acm.forward(&xs)?;
        let score = body
            .iter()
            .fold(xs, |xs, block| xs.apply_t(block, train))
            .apply(tail);

        Ok(DiscriminatorOutput {
            score,
            orthogonality,
            add_attention,
            sub_attention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminator_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = DiscriminatorInit {
            shape: ModelShape {
                img_channels: 3,
                kernel_size: 3,
                num_layers: 5,
                stride: 1,
                num_heads: 4,
            },
            capacity: Capacity {
                nfc: 32,
                min_nfc: 32,
            },
        }
        .build(&vs.root())?;

        let input = Tensor::rand(&[1, 3, 25, 33], FLOAT_CPU);
        let DiscriminatorOutput {
            score,
            orthogonality,
            add_attention,
            sub_attention,
        } = discriminator.forward_t(&input, true)?;

        ensure!(score.size() == vec![1, 1, 15, 23], "incorrect output shape");
        ensure!(orthogonality.numel() == 1);
        ensure!(add_attention.size() == vec![1, 4, 23, 31]);
        ensure!(sub_attention.size() == add_attention.size());
        Ok(())
    }
}
