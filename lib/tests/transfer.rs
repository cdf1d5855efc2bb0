use neural_style as ns;
use rand::{Rng, SeedableRng};
use safetensors::{tensor::TensorView, Dtype};
use std::path::{Path, PathBuf};

fn tmp_dir(name: &str) -> PathBuf {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Serialized tensors for a VGG19 whose layers are all `width` channels wide
fn random_tensors(width: usize, seed: u64) -> Vec<(String, Vec<usize>, Vec<u8>)> {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
    let mut tensors = Vec::new();

    let mut in_channels = 3;
    for layer in ns::Layer::ALL.iter() {
        let scale = (2.0 / (9.0 * in_channels as f32)).sqrt();
        let weight: Vec<u8> = (0..width * in_channels * 9)
            .flat_map(|_| rng.gen_range(-scale..scale).to_le_bytes().to_vec())
            .collect();
        let bias: Vec<u8> = (0..width)
            .flat_map(|_| rng.gen_range(0.0f32..0.1).to_le_bytes().to_vec())
            .collect();

        tensors.push((
            format!("{}.weight", layer),
            vec![width, in_channels, 3, 3],
            weight,
        ));
        tensors.push((format!("{}.bias", layer), vec![width], bias));
        in_channels = width;
    }

    tensors
}

fn serialize(tensors: &[(String, Vec<usize>, Vec<u8>)], dtype: impl Fn(&str) -> Dtype) -> Vec<u8> {
    let views = tensors.iter().map(|(name, shape, data)| {
        (
            name.clone(),
            TensorView::new(dtype(name), shape.clone(), data).unwrap(),
        )
    });

    safetensors::serialize(views, &None).unwrap()
}

fn write_weights(dir: &Path) -> PathBuf {
    let path = dir.join("vgg19.safetensors");
    std::fs::write(&path, serialize(&random_tensors(3, 7), |_| Dtype::F32)).unwrap();
    path
}

fn write_image(path: &Path, width: u32, height: u32, seed: u64) {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
    let img = ns::image::RgbImage::from_fn(width, height, |_, _| {
        ns::image::Rgb([rng.gen(), rng.gen(), rng.gen()])
    });
    img.save(path).unwrap();
}

#[test]
fn transfers_style_end_to_end() {
    let dir = tmp_dir("end_to_end");
    let weights = write_weights(&dir);
    let content = dir.join("content.png");
    let style = dir.join("style.png");
    write_image(&content, 30, 20, 1);
    write_image(&style, 10, 10, 2);

    let generated = ns::Session::builder()
        .content(&content)
        .style(&style)
        .weights(&weights)
        .target_height(32)
        .iterations(2)
        .max_evaluations(3)
        .max_thread_count(2)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert!(generated.loss().is_finite());

    let out = dir.join("target_image").join(ns::output_file_name(&content, &style));
    generated.save(&out).unwrap();

    let reloaded = ns::image::open(&out).unwrap().to_rgb8();
    assert_eq!(reloaded.dimensions(), (48, 32));
    assert_eq!(reloaded.as_raw(), generated.as_ref().as_raw());
}

#[test]
fn results_do_not_depend_on_thread_count() {
    let dir = tmp_dir("determinism");
    let weights = write_weights(&dir);
    let content = dir.join("content.png");
    let style = dir.join("style.png");
    write_image(&content, 20, 16, 3);
    write_image(&style, 16, 16, 4);

    let run = |threads: usize| {
        ns::Session::builder()
            .content(&content)
            .style(&style)
            .weights(&weights)
            .target_height(16)
            .iterations(1)
            .max_evaluations(4)
            .max_thread_count(threads)
            .build()
            .unwrap()
            .run(None)
            .unwrap()
    };

    let single = run(1);
    let multi = run(3);
    assert_eq!(single.loss(), multi.loss());
    assert_eq!(single.as_ref().as_raw(), multi.as_ref().as_raw());
}

#[test]
fn missing_tensor_is_reported() {
    let tensors: Vec<_> = random_tensors(2, 9)
        .into_iter()
        .filter(|(name, _, _)| name != "block5_conv4.bias")
        .collect();

    match ns::Vgg19::from_safetensors(&serialize(&tensors, |_| Dtype::F32)) {
        Err(ns::Error::Weights(ns::WeightsError::MissingTensor(name))) => {
            assert_eq!(name, "block5_conv4.bias");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("loaded an incomplete network"),
    }
}

#[test]
fn non_f32_weights_are_rejected() {
    // the same bytes reinterpreted as half the number of f64 values
    let tensors: Vec<_> = random_tensors(2, 10)
        .into_iter()
        .map(|(name, mut shape, data)| {
            if name == "block1_conv1.weight" {
                shape = vec![1, 3, 3, 3];
            }
            (name, shape, data)
        })
        .collect();

    let buffer = serialize(&tensors, |name| {
        if name == "block1_conv1.weight" {
            Dtype::F64
        } else {
            Dtype::F32
        }
    });

    match ns::Vgg19::from_safetensors(&buffer) {
        Err(ns::Error::Weights(ns::WeightsError::UnsupportedDtype { name, .. })) => {
            assert_eq!(name, "block1_conv1.weight");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("loaded f64 weights"),
    }
}

#[test]
fn channel_chain_is_validated() {
    let mut tensors = random_tensors(2, 11);
    // block1_conv2 now claims to consume 3 channels while block1_conv1 emits 2
    let bytes = vec![0u8; 2 * 3 * 9 * 4];
    tensors[2] = ("block1_conv2.weight".to_owned(), vec![2, 3, 3, 3], bytes);

    match ns::Vgg19::from_safetensors(&serialize(&tensors, |_| Dtype::F32)) {
        Err(ns::Error::Weights(ns::WeightsError::ShapeMismatch { name, .. })) => {
            assert_eq!(name, "block1_conv2.weight");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("loaded a network with mismatched channels"),
    }
}
