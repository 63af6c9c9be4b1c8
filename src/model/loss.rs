use crate::common::*;

#[derive(Debug, Clone)]
pub struct WGanGpInit {
    /// Target gradient norm.
    pub constant: f64,
}

impl WGanGpInit {
    pub fn build(self) -> Result<WGanGp> {
        let Self { constant } = self;
        ensure!(constant > 0.0);
        Ok(WGanGp { c: constant })
    }
}

impl Default for WGanGpInit {
    fn default() -> Self {
        Self { constant: 1.0 }
    }
}

/// Gradient penalty of WGAN-GP, evaluated at random interpolations between
/// real and fake samples. The result is unweighted.
///
/// The critic closure must reduce its scores to a scalar, e.g. by summing
/// a patch score map.
#[derive(Debug)]
pub struct WGanGp {
    c: f64,
}

impl WGanGp {
    pub fn forward(
        &self,
        real: &Tensor,
        fake: &Tensor,
        discriminator: impl FnOnce(&Tensor) -> Result<Tensor>,
    ) -> Result<Tensor> {
        ensure!(fake.size() == real.size());
        ensure!(fake.kind() == real.kind());
        ensure!(fake.device() == real.device());
        ensure!(fake.dim() > 1);

        let Self { c } = *self;
        let batch_size = fake.size()[0];

        let mix = {
            let ratio = Tensor::rand(&[batch_size, 1], (fake.kind(), fake.device()))
                .expand(&[batch_size, fake.numel() as i64 / batch_size], false)
                .contiguous()
                .view(&*fake.size());

            &ratio * real.detach() + (-&ratio + 1.0) * fake.detach()
        }
        .set_requires_grad(true);

        let score = discriminator(&mix)?;
        ensure!(
            score.numel() == 1,
            "the critic must return a scalar, but get shape {:?}",
            score.size()
        );
        let grad = &Tensor::run_backward(
            &[&score], // outputs
            &[&mix],   // inputs
            true,      // keep_graph
            true,      // create_graph
        )[0];
        let penalty = ((grad + 1e-16).norm_scalaropt_dim(2, &[1], false) - c)
            .pow_tensor_scalar(2)
            .mean(Kind::Float);
        debug_assert!(f64::from(&penalty).is_finite());

        Ok(penalty)
    }
}
