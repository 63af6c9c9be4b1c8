use crate::{common::*, image};
use palette::{Hsv, IntoColor, Srgb};
use std::thread::JoinHandle;

const ALPHA: f64 = 0.4;
const TABLE_SIZE: usize = 256;

/// One attention overlay job, carrying everything needed to render it.
#[derive(Debug)]
pub struct HeatmapTask {
    /// `[3, H, W]` CPU tensor in range `[0, 1]`.
    image: Tensor,
    /// `[heads, h, w]` CPU tensor.
    attention: Tensor,
    output_dir: PathBuf,
    label: String,
}

impl HeatmapTask {
    /// Takes a `[1, C, H, W]` image in range `[-1, 1]` and `[1, heads, h, w]`
    /// attention maps. Head `i` is written to `{output_dir}/{label}_{i}.png`.
    pub fn new(
        image: &Tensor,
        attention: &Tensor,
        output_dir: impl AsRef<Path>,
        label: impl Into<String>,
    ) -> Result<Self> {
        let (b, _heads, _h, _w) = attention.size4()?;
        ensure!(b == 1, "expect one attention map batch, but get {}", b);

        Ok(Self {
            image: tch::no_grad(|| image::denorm(image))?,
            attention: attention.detach().to_device(Device::Cpu).get(0),
            output_dir: output_dir.as_ref().to_owned(),
            label: label.into(),
        })
    }

    fn render(&self, color_table: &Tensor) -> Result<()> {
        let Self {
            image,
            attention,
            output_dir,
            label,
        } = self;
        let (_c, height, width) = image.size3()?;
        let (num_heads, _h, _w) = attention.size3()?;

        tch::no_grad(|| {
            (0..num_heads).try_for_each(|head| {
                let map = attention
                    .get(head)
                    .to_kind(Kind::Float)
                    .unsqueeze(0)
                    .unsqueeze(0)
                    .upsample_bilinear2d(&[height, width], false, None::<f64>, None::<f64>)
                    .view([height, width]);
                let min = map.min();
                let range = (map.max() - &min).clamp_min(1e-12);
                let index = ((map - min) / range * (TABLE_SIZE - 1) as f64)
                    .round()
                    .clamp(0.0, (TABLE_SIZE - 1) as f64)
                    .to_kind(Kind::Int64);
                let colors = color_table
                    .index_select(0, &index.view([-1]))
                    .view([height, width, 3])
                    .permute(&[2, 0, 1]);

                let blended = image * (1.0 - ALPHA) + colors * ALPHA;
                let path = output_dir.join(format!("{}_{}.png", label, head));
                image::save_unit_image(&blended, path)
            })
        })
    }
}

/// Blue to red colour table of shape `[256, 3]`.
fn color_table() -> Tensor {
    let values: Vec<f32> = (0..TABLE_SIZE)
        .flat_map(|index| {
            let hue = 240.0 * (1.0 - index as f32 / (TABLE_SIZE - 1) as f32);
            let hsv: Hsv = Hsv::new(hue, 1.0, 1.0);
            let rgb: Srgb = hsv.into_color();
            [rgb.red, rgb.green, rgb.blue]
        })
        .collect();
    Tensor::of_slice(&values).view([TABLE_SIZE as i64, 3])
}

/// Fixed-size pool of threads writing heatmap overlays.
///
/// Submission never waits for rendering. Pending tasks are flushed by
/// [`HeatmapPool::finish`] or on drop.
#[derive(Debug)]
pub struct HeatmapPool {
    tx: Option<flume::Sender<HeatmapTask>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl HeatmapPool {
    pub fn new(num_workers: usize) -> Self {
        let (tx, rx) = flume::unbounded::<HeatmapTask>();

        let workers = (0..num_workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || -> Result<()> {
                    let color_table = color_table();
                    for task in rx.iter() {
                        fs::create_dir_all(&task.output_dir)?;
                        task.render(&color_table)?;
                    }
                    Ok(())
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn submit(&self, task: HeatmapTask) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| format_err!("the heatmap pool is closed"))?;
        tx.send(task)
            .map_err(|_| format_err!("every heatmap worker has stopped"))?;
        Ok(())
    }

    /// Waits for pending tasks and returns the first worker error.
    pub fn finish(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        self.tx = None;

        self.workers
            .drain(..)
            .map(|worker| {
                worker
                    .join()
                    .map_err(|_| format_err!("a heatmap worker panicked"))?
            })
            .fold(Ok(()), |result, worker_result| result.and(worker_result))
    }
}

impl Drop for HeatmapPool {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            warn!("heatmap rendering failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_table_runs_blue_to_red() -> Result<()> {
        let table = color_table();
        ensure!(table.size() == vec![256, 3]);

        ensure!(table.double_value(&[0, 2]) > 0.99 && table.double_value(&[0, 0]) < 0.01);
        ensure!(table.double_value(&[255, 0]) > 0.99 && table.double_value(&[255, 2]) < 0.01);
        Ok(())
    }

    #[test]
    fn pool_writes_one_image_per_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = HeatmapPool::new(2);

        let image = Tensor::rand(&[1, 3, 8, 8], FLOAT_CPU) * 2.0 - 1.0;
        let attention = Tensor::rand(&[1, 2, 4, 4], FLOAT_CPU);
        pool.submit(HeatmapTask::new(&image, &attention, dir.path(), "0_real_add")?)?;
        pool.submit(HeatmapTask::new(&image, &attention, dir.path(), "0_real_sub")?)?;
        pool.finish()?;

        for name in [
            "0_real_add_0.png",
            "0_real_add_1.png",
            "0_real_sub_0.png",
            "0_real_sub_1.png",
        ] {
            ensure!(dir.path().join(name).is_file(), "missing {}", name);
        }
        Ok(())
    }
}
