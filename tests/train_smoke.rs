use std::fs;
use std::path::Path;

use candle_core::Device;
use clap::Parser;
use ndarray::{Array2, Array4};
use ndarray_npy::read_npy;
use person_heatmap::config::TrainConfig;
use person_heatmap::train::{build_model, run_training};

fn write_tud_set(root: &Path) {
    fs::create_dir_all(root).unwrap();
    let mut idl = String::new();
    for idx in 0..4 {
        let name = format!("frame-{idx:03}.png");
        let image = image::RgbImage::from_fn(16, 16, |x, y| {
            if x < 8 && idx % 2 == 0 {
                image::Rgb([220, 40, 40])
            } else {
                image::Rgb([(x * 10) as u8, (y * 10) as u8, 90])
            }
        });
        image.save(root.join(&name)).unwrap();
        let boxes = if idx % 2 == 0 { ": (0, 0, 8, 16)" } else { "" };
        let terminator = if idx == 3 { '.' } else { ';' };
        idl.push_str(&format!("\"{name}\"{boxes}{terminator}\n"));
    }
    fs::write(root.join("annotations.idl"), idl).unwrap();
}

fn tiny_config(tud_root: &Path, output_dir: &Path, extra: &[&str]) -> TrainConfig {
    let mut args = vec![
        "person-heatmap".to_string(),
        "--tud-root".to_string(),
        tud_root.display().to_string(),
        "--no-inria".to_string(),
        "--width".to_string(),
        "8".to_string(),
        "--height".to_string(),
        "8".to_string(),
        "--out-width".to_string(),
        "2".to_string(),
        "--out-height".to_string(),
        "2".to_string(),
        "--batch-size".to_string(),
        "2".to_string(),
        "--test-fraction".to_string(),
        "0.5".to_string(),
        "--output-dir".to_string(),
        output_dir.display().to_string(),
        "--run-name".to_string(),
        "smoke".to_string(),
    ];
    args.extend(extra.iter().map(|arg| arg.to_string()));
    TrainConfig::parse_from(args)
}

#[test]
fn trains_one_epoch_and_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let tud_root = dir.path().join("tud");
    let output_dir = dir.path().join("out");
    write_tud_set(&tud_root);

    let summary = run_training(&tiny_config(&tud_root, &output_dir, &[])).unwrap();
    assert_eq!(summary.train_examples, 2);
    assert_eq!(summary.test_examples, 2);
    assert_eq!(summary.test.batches, 1);
    assert!((0.0..=1.0).contains(&summary.test.accuracy));
    assert!(summary.test.loss.is_finite());

    let y: Array2<f32> = read_npy(output_dir.join("y.npy")).unwrap();
    assert_eq!(y.shape(), &[1, 4]);
    let w1: Array4<f32> = read_npy(output_dir.join("W1.npy")).unwrap();
    assert_eq!(w1.shape(), &[5, 5, 3, 32]);
    let y_u8: Array2<u8> = read_npy(output_dir.join("y_u8.npy")).unwrap();
    assert_eq!(y_u8.shape(), &[2, 2]);

    let out = image::open(output_dir.join("out.png")).unwrap().to_luma8();
    assert_eq!(out.dimensions(), (2, 2));
    let preview = image::open(output_dir.join("preview.png")).unwrap();
    assert_eq!((preview.width(), preview.height()), (16, 8));
    assert!(output_dir.join("input.png").exists());

    let run_dir = output_dir.join("runs").join("smoke");
    assert!(run_dir.join("config.json").exists());
    assert!(run_dir.join("metrics_history.json").exists());
    assert!(run_dir.join("summary.json").exists());
    assert!(run_dir.join("checkpoints").join("last.safetensors").exists());
}

#[test]
fn resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let tud_root = dir.path().join("tud");
    let output_dir = dir.path().join("out");
    write_tud_set(&tud_root);

    run_training(&tiny_config(&tud_root, &output_dir, &[])).unwrap();
    let checkpoint = output_dir
        .join("runs")
        .join("smoke")
        .join("checkpoints")
        .join("last.safetensors");

    let resumed_dir = dir.path().join("resumed");
    let resume_arg = checkpoint.display().to_string();
    let summary = run_training(&tiny_config(
        &tud_root,
        &resumed_dir,
        &["--resume", &resume_arg, "--epochs", "2"],
    ))
    .unwrap();
    assert_eq!(summary.train_examples, 2);

    let history: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(resumed_dir.join("runs/smoke/metrics_history.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 2);
}

#[test]
fn missing_dataset_root_fails_with_context() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny_config(&dir.path().join("nope"), &dir.path().join("out"), &[]);
    let err = run_training(&cfg).unwrap_err();
    assert!(format!("{err:#}").contains("Failed loading TUD dataset"));
}

#[test]
fn resume_restores_checkpoint_weights_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let tud_root = dir.path().join("tud");
    let output_dir = dir.path().join("out");
    write_tud_set(&tud_root);

    run_training(&tiny_config(&tud_root, &output_dir, &[])).unwrap();
    let checkpoint = output_dir.join("runs/smoke/checkpoints/last.safetensors");
    let saved = candle_core::safetensors::load(&checkpoint, &Device::Cpu).unwrap();
    let saved_conv1 = saved["conv1.weight"].flatten_all().unwrap().to_vec1::<f32>().unwrap();

    let resume_arg = checkpoint.display().to_string();
    let fresh_cfg = tiny_config(&tud_root, &output_dir, &["--seed", "7"]);
    let resumed_cfg = tiny_config(&tud_root, &output_dir, &["--seed", "7", "--resume", &resume_arg]);

    let (fresh_vars, _) = build_model(&fresh_cfg, &Device::Cpu).unwrap();
    let (resumed_vars, _) = build_model(&resumed_cfg, &Device::Cpu).unwrap();
    let conv1 = |vars: &candle_nn::VarMap| {
        let data = vars.data().lock().unwrap();
        data["conv1.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    };

    assert_eq!(conv1(&resumed_vars), saved_conv1);
    assert_ne!(conv1(&fresh_vars), saved_conv1);
}

#[test]
fn diverging_loss_aborts_with_step() {
    let dir = tempfile::tempdir().unwrap();
    let tud_root = dir.path().join("tud");
    write_tud_set(&tud_root);

    let cfg = tiny_config(
        &tud_root,
        &dir.path().join("out"),
        &["--lr", "1e30", "--batch-size", "1"],
    );
    let err = run_training(&cfg).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Training diverged"), "{message}");
    assert!(message.contains("at step 1"), "{message}");
}
