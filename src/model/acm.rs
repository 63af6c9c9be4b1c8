use super::conv_block::conv_config;
use crate::common::*;

/// Attentional context modulation.
///
/// Two attention branches pool the mean-centered feature map into an
/// additive context `K` and a subtractive context `Q`. A channel gate `P`
/// computed from the spatial mean rescales the result, so the block
/// outputs `(x + K - Q) * P`.
#[derive(Debug, Clone)]
pub struct AcmInit {
    pub num_heads: usize,
    pub channels: usize,
}

impl AcmInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Acm> {
        let path = path.borrow();
        let Self {
            num_heads,
            channels,
        } = self;

        ensure!(
            channels % num_heads == 0 && (channels / 2) % num_heads == 0,
            "num_heads ({}) must divide both {} and {}",
            num_heads,
            channels,
            channels / 2
        );

        let add = AttendInit {
            num_heads,
            channels,
        }
        .build(path / "add");
        let sub = AttendInit {
            num_heads,
            channels,
        }
        .build(path / "sub");

        let compressed = channels / 2;
        let squeeze = nn::conv2d(
            &(path / "modulate") / "squeeze",
            channels as i64,
            compressed as i64,
            1,
            conv_config(1, num_heads),
        );
        let excite = nn::conv2d(
            &(path / "modulate") / "excite",
            compressed as i64,
            channels as i64,
            1,
            conv_config(1, num_heads),
        );

        Ok(Acm {
            add,
            sub,
            squeeze,
            excite,
        })
    }
}

#[derive(Debug)]
pub struct Acm {
    add: Attend,
    sub: Attend,
    squeeze: nn::Conv2D,
    excite: nn::Conv2D,
}

#[derive(Debug)]
pub struct AcmOutput {
    pub output: Tensor,
    /// Mean of `K * Q` over channels, shape `[B, 1, 1, 1]`.
    pub orthogonality: Tensor,
    /// Additive attention weights, shape `[B, heads, H, W]`.
    pub add_attention: Tensor,
    /// Subtractive attention weights, shape `[B, heads, H, W]`.
    pub sub_attention: Tensor,
}

impl Acm {
    pub fn forward(&self, xs: &Tensor) -> Result<AcmOutput> {
        let Self {
            add,
            sub,
            squeeze,
            excite,
        } = self;

        let mu = xs.mean_dim(&[2, 3], true, Kind::Float);
        let centered = xs - &mu;

        let (add_context, add_attention) = add.forward(&centered)?;
        let (sub_context, sub_attention) = sub.forward(&centered)?;
        let gate = mu.apply(squeeze).relu().apply(excite).sigmoid();

        let output = (xs + &add_context - &sub_context) * gate;
        let orthogonality = (&add_context * &sub_context).mean_dim(&[1], true, Kind::Float);

        Ok(AcmOutput {
            output,
            orthogonality,
            add_attention,
            sub_attention,
        })
    }
}

#[derive(Debug, Clone)]
struct AttendInit {
    num_heads: usize,
    channels: usize,
}

impl AttendInit {
    fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Attend {
        let path = path.borrow();
        let Self {
            num_heads,
            channels,
        } = self;

        let map_gen = nn::conv2d(
            path / "map_gen",
            channels as i64,
            num_heads as i64,
            1,
            conv_config(1, num_heads),
        );

        Attend {
            map_gen,
            num_heads: num_heads as i64,
        }
    }
}

/// Per-head spatial softmax pooling.
#[derive(Debug)]
struct Attend {
    map_gen: nn::Conv2D,
    num_heads: i64,
}

impl Attend {
    /// Returns the pooled context `[B, C, 1, 1]` and the attention weights
    /// `[B, heads, H, W]`.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let Self {
            ref map_gen,
            num_heads,
        } = *self;
        let (b, c, h, w) = xs.size4()?;
        let head_channels = c / num_heads;

        let weights = xs
            .apply(map_gen)
            .view([b * num_heads, 1, h * w])
            .softmax(2, Kind::Float);
        let context = xs
            .contiguous()
            .view([b * num_heads, head_channels, h * w])
            .bmm(&weights.transpose(1, 2))
            .view([b, c, 1, 1]);
        let attention = weights.view([b, num_heads, h, w]);

        Ok((context, attention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn acm_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let acm = AcmInit {
            num_heads: 2,
            channels: 8,
        }
        .build(&vs.root())?;

        let xs = Tensor::randn(&[1, 8, 5, 6], FLOAT_CPU);
        let AcmOutput {
            output,
            orthogonality,
            add_attention,
            sub_attention,
        } = acm.forward(&xs)?;

        ensure!(output.size() == vec![1, 8, 5, 6]);
        ensure!(orthogonality.size() == vec![1, 1, 1, 1]);
        ensure!(add_attention.size() == vec![1, 2, 5, 6]);
        ensure!(sub_attention.size() == vec![1, 2, 5, 6]);

        // each head is a distribution over positions
        let head_sums = add_attention.sum_dim_intlist(&[2, 3], false, Kind::Float);
        for head in 0..2 {
            assert_abs_diff_eq!(head_sums.double_value(&[0, head]), 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn rejects_indivisible_heads() {
        let vs = nn::VarStore::new(Device::Cpu);
        let init = AcmInit {
            num_heads: 3,
            channels: 8,
        };
        assert!(init.clone().build(&vs.root() / "three").is_err());
        assert!(AcmInit { num_heads: 2, ..init }
            .build(&vs.root() / "two")
            .is_ok());
    }
}
