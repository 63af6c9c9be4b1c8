use crate::common::*;

/// Output length after scaling `len` by `scale`.
///
/// Rounds up, except that values within floating point noise of an
/// integer snap to that integer, so `6 / 0.75` yields 8 rather than 9.
pub fn scaled_len(len: i64, scale: f64) -> i64 {
    let value = len as f64 * scale;
    let rounded = value.round();
    let output = if (value - rounded).abs() < 1e-6 {
        rounded
    } else {
        value.ceil()
    };
    output as i64
}

/// Loads an image file as a `[1, C, H, W]` float tensor in range `[-1, 1]`.
pub fn read_image(path: impl AsRef<Path>, channels: usize, device: Device) -> Result<Tensor> {
    let path = path.as_ref();
    let image = tch::vision::image::load(path)
        .with_context(|| format!("unable to load image '{}'", path.display()))?;
    let (in_c, _h, _w) = image.size3()?;
    ensure!(
        in_c >= channels as i64,
        "image '{}' has {} channels, but {} channels are requested",
        path.display(),
        in_c,
        channels
    );

    let image = image.narrow(0, 0, channels as i64).to_kind(Kind::Float) / 255.0;
    let image = ((image - 0.5) * 2.0).unsqueeze(0).to_device(device);
    Ok(image)
}

/// Maps a `[1, C, H, W]` or `[C, H, W]` tensor in range `[-1, 1]` to a
/// `[3, H, W]` CPU tensor in range `[0, 1]`.
pub fn denorm(image: &Tensor) -> Result<Tensor> {
    let image = match image.dim() {
        4 => {
            let (b, _c, _h, _w) = image.size4()?;
            ensure!(b == 1, "expect batch size 1, but get {}", b);
            image.get(0)
        }
        3 => image.shallow_clone(),
        _ => bail!("expect a 3D or 4D image tensor, but get {:?}", image.size()),
    };
    let (c, h, w) = image.size3()?;
    let image = match c {
        1 => image.expand(&[3, h, w], false),
        3 => image,
        c if c > 3 => image.narrow(0, 0, 3),
        _ => bail!("unsupported channel count {}", c),
    };

    let image = ((image.detach().to_device(Device::Cpu) + 1.0) / 2.0).clamp(0.0, 1.0);
    Ok(image)
}

/// Writes an image tensor in range `[-1, 1]` to a PNG file.
pub fn save_image(image: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let image = tch::no_grad(|| denorm(image))?;
    save_unit_image(&image, path)
}

/// Writes a `[3, H, W]` tensor in range `[0, 1]` to a PNG file.
pub fn save_unit_image(image: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let image = (image * 255.0).round().to_kind(Kind::Uint8);
    tch::vision::image::save(&image, path)
        .with_context(|| format!("unable to save image '{}'", path.display()))?;
    Ok(())
}

/// Resizes a `[B, C, H, W]` tensor by a scale factor.
pub fn resize(image: &Tensor, scale: f64) -> Result<Tensor> {
    ensure!(scale > 0.0, "scale must be positive, but get {}", scale);
    let (_b, _c, h, w) = image.size4()?;
    resize_to(image, scaled_len(h, scale), scaled_len(w, scale))
}

/// Resizes a `[B, C, H, W]` tensor to an exact spatial size.
///
/// Shrinking uses area averaging and growing uses bicubic interpolation.
pub fn resize_to(image: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    ensure!(
        height > 0 && width > 0,
        "cannot resize to empty size {}x{}",
        height,
        width
    );
    let (_b, _c, in_h, in_w) = image.size4()?;

    let output = if (height, width) == (in_h, in_w) {
        image.shallow_clone()
    } else if height <= in_h && width <= in_w {
        image.adaptive_avg_pool2d(&[height, width])
    } else {
        image.upsample_bicubic2d(&[height, width], false, None::<f64>, None::<f64>)
    };

    Ok(output)
}

/// Takes the top-left `height` x `width` region of a `[B, C, H, W]` tensor.
pub fn crop_to(image: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    let (_b, _c, in_h, in_w) = image.size4()?;
    ensure!(
        in_h >= height && in_w >= width,
        "cannot crop a {}x{} image to {}x{}",
        in_h,
        in_w,
        height,
        width
    );
    Ok(image.narrow(2, 0, height).narrow(3, 0, width))
}
