use acm_singan::{
    common::*,
    config::Config,
    image, inference, orchestrator, pyramid,
    state::{TrainedPyramid, FIXED_NOISES_FILE, MANIFEST_FILE, REALS_FILE},
};

/// Three levels of 5x5, 6x6 and 8x8 trained for one iteration each.
fn tiny_config(exp_dir: &Path, save_attention_map: bool) -> Result<Config> {
    let text = format!(
        r#"{{
            input: {{ image_path: "{image}", img_channels: 3 }},
            pyramid: {{ scale_factor: 0.75, stop_scale: 2, min_size: 4, max_size: 250 }},
            model: {{
                kernel_size: 3,
                num_layers: 2,
                stride: 1,
                num_heads: 2,
                capacity: {{ nfc_init: 8, min_nfc_init: 8 }},
            }},
            train: {{
                device: "cpu",
                seed: 3,
                num_iter: 1,
                n_critic: 1,
                generator_iter: 1,
                g_lr: 0.0005,
                d_lr: 0.0005,
                beta1: 0.5,
                beta2: 0.999,
                milestones: [1600],
                gamma: 0.1,
                noise_amp_init: 0.1,
            }},
            loss: {{ gp_weight: 0.1, rec_weight: 10.0, use_acm_oth: true, acm_weight: 0.1 }},
            logging: {{
                exp_dir: "{exp}",
                img_save_iter: 500,
                save_attention_map: {attention},
            }},
            inference: {{
                infer_dir: "{infer}",
                num_samples: 2,
                scale_h: 1.0,
                scale_w: 1.0,
                gen_start_scale: 0,
                use_fixed_noise: false,
                save_all_pyramid: true,
                save_attention_map: {attention},
                sr_iterations: 2,
            }},
        }}"#,
        image = exp_dir.join("input.png").display(),
        exp = exp_dir.display(),
        infer = exp_dir.join("infer").display(),
        attention = save_attention_map,
    );

    let config: Config = json5::from_str(&text)?;
    Ok(config)
}

fn write_input_image(path: &Path) -> Result<()> {
    let image = (Tensor::rand(&[3, 8, 8], FLOAT_CPU) * 255.0).to_kind(Kind::Uint8);
    tch::vision::image::save(&image, path)?;
    Ok(())
}

fn png_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<_> = fs::read_dir(dir)?
        .map(|entry| -> Result<_> { Ok(entry?.file_name().to_string_lossy().into_owned()) })
        .filter_ok(|name| name.ends_with(".png"))
        .try_collect()?;
    names.sort();
    Ok(names)
}

#[test]
fn train_then_infer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let exp_dir = dir.path();
    write_input_image(&exp_dir.join("input.png"))?;
    let config = tiny_config(exp_dir, false)?;
    config.validate()?;

    let trained = orchestrator::train_pyramid(&config, None)?;
    ensure!(trained.levels().len() == 3);

    // persisted state
    for file in [MANIFEST_FILE, REALS_FILE, FIXED_NOISES_FILE] {
        ensure!(exp_dir.join(file).is_file(), "missing {}", file);
    }
    for level in 0..3 {
        let level_dir = exp_dir.join(level.to_string());
        for file in ["generator.ot", "discriminator.ot", "real_scale.png"] {
            ensure!(level_dir.join(file).is_file(), "missing {}/{}", level, file);
        }
    }
    ensure!(!exp_dir.join("3").exists());

    // the persisted reals match a fresh build of the pyramid
    let source = image::read_image(&config.input.image_path, 3, Device::Cpu)?;
    let (_, reals) = pyramid::prepare_reals(&source, &config.pyramid, 3)?;
    let loaded = TrainedPyramid::load(exp_dir, Device::Cpu)?;
    ensure!(loaded.reals().len() == reals.len());
    ensure!(izip!(loaded.reals(), &reals).all(|(lhs, rhs)| lhs.equal(rhs)));
    ensure!(loaded.is_complete());

    // two samples through three levels
    let sample = inference::run_inference(&config, None)?;
    ensure!(sample.size() == vec![1, 3, 8, 8]);
    let names = png_names(&config.inference.infer_dir)?;
    ensure!(
        names == vec!["0_0.png", "0_1.png", "0_2.png", "1_0.png", "1_1.png", "1_2.png"],
        "unexpected outputs {:?}",
        names
    );
    Ok(())
}

#[test]
fn resume_skips_trained_levels() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let exp_dir = dir.path();
    write_input_image(&exp_dir.join("input.png"))?;
    let mut config = tiny_config(exp_dir, false)?;

    orchestrator::train_pyramid(&config, None)?;
    let manifest = fs::read_to_string(exp_dir.join(MANIFEST_FILE))?;

    config.logging.resume = true;
    let resumed = orchestrator::train_pyramid(&config, None)?;
    ensure!(resumed.levels().len() == 3);
    ensure!(fs::read_to_string(exp_dir.join(MANIFEST_FILE))? == manifest);
    Ok(())
}

#[test]
fn attention_maps_and_super_resolution() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let exp_dir = dir.path();
    write_input_image(&exp_dir.join("input.png"))?;
    let config = tiny_config(exp_dir, true)?;

    orchestrator::train_pyramid(&config, None)?;
    let attention_dir = exp_dir.join("0").join("attention");
    for label in ["real_add", "real_sub", "fake_add", "fake_sub"] {
        for head in 0..2 {
            let name = format!("0_{}_{}.png", label, head);
            ensure!(attention_dir.join(&name).is_file(), "missing {}", name);
        }
    }

    let sample = inference::run_super_resolution(&config, None)?;
    ensure!(sample.size() == vec![1, 3, 15, 15]);

    let infer_dir = &config.inference.infer_dir;
    ensure!(infer_dir.join("0_real.png").is_file());
    ensure!(infer_dir.join("1_real.png").is_file());
    ensure!(infer_dir
        .join("attention")
        .join("1_1thG_infer_sub_1.png")
        .is_file());
    Ok(())
}
