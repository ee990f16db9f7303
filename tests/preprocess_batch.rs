use std::io::Cursor;

use image::{
    DynamicImage, GrayImage, ImageBuffer, ImageOutputFormat, Luma, Rgb, RgbImage, RgbaImage,
};
use text_det_preprocess::{
    image::{MEAN, VARIANCE},
    ImagePreprocessor, InferenceRequest, PreprocessError, Tensor, TensorData,
};

const WIDTH: usize = 2240;
const HEIGHT: usize = 1920;
const PLANE: usize = WIDTH * HEIGHT;

fn model_config(filter: &str, parallel: bool) -> String {
    format!(
        r#"{{
            "name": "pre",
            "backend": "python",
            "input": [{{"name": "input", "data_type": "TYPE_STRING", "dims": ["1"]}}],
            "output": [
                {{"name": "output", "data_type": "TYPE_FP32", "dims": ["3", "1920", "2240"]}},
                {{"name": "image", "data_type": "TYPE_UINT8", "dims": ["1920", "2240", "3"]}},
                {{"name": "scale", "data_type": "TYPE_FP64", "dims": ["2"]}}
            ],
            "parameters": {{
                "resize_filter": {{"string_value": "{filter}"}},
                "parallel_batch": {{"string_value": "{parallel}"}}
            }}
        }}"#
    )
}

fn preprocessor() -> ImagePreprocessor {
    ImagePreprocessor::from_json(&model_config("nearest", false)).unwrap()
}

fn png(img: DynamicImage) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageOutputFormat::Png).unwrap();
    bytes.into_inner()
}

fn solid_rgb(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
    png(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb(pixel),
    )))
}

fn request_all(blobs: Vec<Vec<u8>>) -> InferenceRequest {
    InferenceRequest::new("req-1")
        .with_input(Tensor::from_blobs("input", blobs))
        .with_requested_output("output")
        .with_requested_output("image")
        .with_requested_output("scale")
}

fn normalized(value: u8, channel: usize) -> f32 {
    let mean = (MEAN[channel] * 255.0) as f32;
    let variance = (VARIANCE[channel] * 255.0) as f32;
    (f32::from(value) - mean) / variance
}

fn fp32(tensor: &Tensor) -> &[f32] {
    match &tensor.data {
        TensorData::Fp32(values) => values,
        other => panic!("expected FP32 data, got {:?}", other.data_type()),
    }
}

fn fp64(tensor: &Tensor) -> &[f64] {
    match &tensor.data {
        TensorData::Fp64(values) => values,
        other => panic!("expected FP64 data, got {:?}", other.data_type()),
    }
}

fn uint8(tensor: &Tensor) -> &[u8] {
    match &tensor.data {
        TensorData::Uint8(values) => values,
        other => panic!("expected UINT8 data, got {:?}", other.data_type()),
    }
}

#[test]
fn batch_outputs_align_with_inputs() {
    let blobs = vec![
        solid_rgb(1120, 960, [255, 0, 0]),
        solid_rgb(64, 48, [0, 128, 0]),
    ];
    let response = preprocessor().process(&request_all(blobs)).unwrap();

    let names: Vec<&str> = response.outputs.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["output", "image", "scale"]);

    let output = response.output("output").unwrap();
    assert_eq!(output.shape, vec![2, 3, 1920, 2240]);
    let image = response.output("image").unwrap();
    assert_eq!(image.shape, vec![2, 1920, 2240, 3]);
    let scale = response.output("scale").unwrap();
    assert_eq!(scale.shape, vec![2, 2]);

    let scales = fp64(scale);
    assert_eq!(scales, &[0.5, 0.5, 64.0 / 2240.0, 48.0 / 1920.0]);

    let tensor = fp32(output);
    assert_eq!(tensor.len(), 2 * 3 * PLANE);
    // First image is pure red, second pure dark green.
    assert!((tensor[0] - normalized(255, 0)).abs() < 1e-6);
    assert!((tensor[PLANE] - normalized(0, 1)).abs() < 1e-6);
    let second = 3 * PLANE;
    assert!((tensor[second] - normalized(0, 0)).abs() < 1e-6);
    assert!((tensor[second + PLANE + 7] - normalized(128, 1)).abs() < 1e-6);

    let pixels = uint8(image);
    assert_eq!(&pixels[..3], &[255, 0, 0]);
    assert_eq!(&pixels[3 * PLANE..3 * PLANE + 3], &[0, 128, 0]);
}

#[test]
fn double_canvas_scales_by_two() {
    let blob = png(DynamicImage::ImageLuma8(GrayImage::new(4480, 3840)));
    let request = InferenceRequest::new("big")
        .with_input(Tensor::from_blobs("input", vec![blob]))
        .with_requested_output("output")
        .with_requested_output("scale");

    let response = preprocessor().process(&request).unwrap();
    assert_eq!(fp64(response.output("scale").unwrap()), &[2.0, 2.0]);
    assert_eq!(
        response.output("output").unwrap().shape,
        vec![1, 3, 1920, 2240]
    );
}

#[test]
fn grayscale_channel_is_duplicated() {
    let mut gray = GrayImage::new(2, 2);
    gray.put_pixel(0, 0, Luma([10]));
    gray.put_pixel(1, 0, Luma([20]));
    gray.put_pixel(0, 1, Luma([30]));
    gray.put_pixel(1, 1, Luma([40]));
    let blob = png(DynamicImage::ImageLuma8(gray));

    let response = preprocessor().process(&request_all(vec![blob])).unwrap();

    let pixels = uint8(response.output("image").unwrap());
    assert_eq!(pixels.len(), PLANE * 3);
    // Nearest upscaling keeps quadrants: top-left 10, bottom-right 40.
    let at = |y: usize, x: usize| &pixels[(y * WIDTH + x) * 3..(y * WIDTH + x) * 3 + 3];
    assert_eq!(at(0, 0), &[10, 10, 10]);
    assert_eq!(at(0, WIDTH - 1), &[20, 20, 20]);
    assert_eq!(at(HEIGHT - 1, 0), &[30, 30, 30]);
    assert_eq!(at(HEIGHT - 1, WIDTH - 1), &[40, 40, 40]);

    let tensor = fp32(response.output("output").unwrap());
    for c in 0..3 {
        let corner = c * PLANE + (HEIGHT - 1) * WIDTH + (WIDTH - 1);
        assert!((tensor[corner] - normalized(40, c)).abs() < 1e-6);
        assert!((tensor[c * PLANE] - normalized(10, c)).abs() < 1e-6);
    }
}

#[test]
fn sixteen_bit_gray_is_reduced_to_eight_bits() {
    let mut gray: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::new(2, 2);
    gray.put_pixel(0, 0, Luma([0]));
    gray.put_pixel(1, 0, Luma([100 * 257]));
    gray.put_pixel(0, 1, Luma([7 * 257]));
    gray.put_pixel(1, 1, Luma([u16::MAX]));
    let blob = png(DynamicImage::ImageLuma16(gray));

    let response = preprocessor().process(&request_all(vec![blob])).unwrap();

    let image = response.output("image").unwrap();
    assert_eq!(image.shape, vec![1, 1920, 2240, 3]);
    let pixels = uint8(image);
    let at = |y: usize, x: usize| &pixels[(y * WIDTH + x) * 3..(y * WIDTH + x) * 3 + 3];
    assert_eq!(at(0, 0), &[0, 0, 0]);
    assert_eq!(at(0, WIDTH - 1), &[100, 100, 100]);
    assert_eq!(at(HEIGHT - 1, 0), &[7, 7, 7]);
    assert_eq!(at(HEIGHT - 1, WIDTH - 1), &[255, 255, 255]);
}

#[test]
fn bmp_images_are_decoded() {
    let mut blob = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(1120, 480, Rgb([40, 80, 120])))
        .write_to(&mut blob, ImageOutputFormat::Bmp)
        .unwrap();

    let response = preprocessor()
        .process(&request_all(vec![blob.into_inner()]))
        .unwrap();

    assert_eq!(fp64(response.output("scale").unwrap()), &[0.5, 0.25]);
    let pixels = uint8(response.output("image").unwrap());
    assert_eq!(&pixels[..3], &[40, 80, 120]);
    let tensor = fp32(response.output("output").unwrap());
    assert!((tensor[2 * PLANE] - normalized(120, 2)).abs() < 1e-6);
}

#[test]
fn flat_input_shape_is_accepted() {
    let request = InferenceRequest::new("flat")
        .with_input(Tensor::new(
            "input",
            vec![2],
            TensorData::Bytes(vec![solid_rgb(4, 4, [1, 1, 1]), solid_rgb(4, 4, [2, 2, 2])]),
        ))
        .with_requested_output("output")
        .with_requested_output("scale");

    let response = preprocessor().process(&request).unwrap();
    assert_eq!(response.output("output").unwrap().shape, vec![2, 3, 1920, 2240]);
    assert_eq!(response.output("scale").unwrap().shape, vec![2, 2]);
}

#[test]
fn overflowing_input_shape_is_malformed() {
    let request = InferenceRequest::new("huge")
        .with_input(Tensor::new(
            "input",
            vec![1 << 32, 1 << 32],
            TensorData::Bytes(Vec::new()),
        ))
        .with_requested_output("output");

    assert!(matches!(
        preprocessor().process(&request),
        Err(PreprocessError::MalformedTensor { .. })
    ));
}

#[test]
fn only_requested_outputs_are_returned() {
    let request = InferenceRequest::new("partial")
        .with_input(Tensor::from_blobs("input", vec![solid_rgb(8, 8, [1, 2, 3])]))
        .with_requested_output("scale")
        .with_requested_output("output");

    let response = preprocessor().process(&request).unwrap();
    let names: Vec<&str> = response.outputs.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["output", "scale"]);
}

#[test]
fn missing_primary_output_fails_before_decoding() {
    let request = InferenceRequest::new("no-output")
        .with_input(Tensor::from_blobs("input", vec![b"not an image".to_vec()]))
        .with_requested_output("image")
        .with_requested_output("scale");

    match preprocessor().process(&request) {
        Err(PreprocessError::MissingOutput { output, requested }) => {
            assert_eq!(output, "output");
            assert_eq!(requested, vec!["image".to_string(), "scale".to_string()]);
        }
        other => panic!("expected missing output, got {other:?}"),
    }
}

#[test]
fn missing_input_names_the_request() {
    let request = InferenceRequest::new("req-42").with_requested_output("output");
    let err = preprocessor().process(&request).unwrap_err();
    assert!(matches!(err, PreprocessError::MissingInput { .. }));
    assert!(err.to_string().contains("req-42"), "{err}");
}

#[test]
fn numeric_input_is_rejected() {
    let request = InferenceRequest::new("numeric")
        .with_input(Tensor::new(
            "input",
            vec![2, 1],
            TensorData::Uint8(vec![1, 2]),
        ))
        .with_requested_output("output");

    match preprocessor().process(&request) {
        Err(PreprocessError::InvalidInputType { expected, actual }) => {
            assert_eq!(expected, "BYTES");
            assert_eq!(actual, "UINT8");
        }
        other => panic!("expected invalid input type, got {other:?}"),
    }
}

#[test]
fn corrupt_image_fails_whole_batch() {
    let blobs = vec![
        solid_rgb(8, 8, [9, 9, 9]),
        b"\x89PNG\r\n\x1a\ntruncated".to_vec(),
        solid_rgb(8, 8, [9, 9, 9]),
    ];
    match preprocessor().process(&request_all(blobs)) {
        Err(PreprocessError::Decode { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected decode error, got {other:?}"),
    }
}

#[test]
fn alpha_images_are_unsupported() {
    let blob = png(DynamicImage::ImageRgba8(RgbaImage::new(4, 4)));
    match preprocessor().process(&request_all(vec![blob])) {
        Err(PreprocessError::UnsupportedChannelLayout { index, channels }) => {
            assert_eq!(index, 0);
            assert_eq!(channels, 4);
        }
        other => panic!("expected unsupported layout, got {other:?}"),
    }
}

#[test]
fn parallel_batch_matches_sequential() {
    let blobs = vec![solid_rgb(30, 20, [200, 10, 90]), solid_rgb(5, 7, [1, 2, 3])];
    let sequential = ImagePreprocessor::from_json(&model_config("triangle", false)).unwrap();
    let parallel = ImagePreprocessor::from_json(&model_config("triangle", true)).unwrap();

    let request = InferenceRequest::new("par")
        .with_input(Tensor::from_blobs("input", blobs))
        .with_requested_output("output")
        .with_requested_output("scale");

    assert_eq!(
        sequential.process(&request).unwrap(),
        parallel.process(&request).unwrap()
    );
}

#[test]
fn parallel_batch_reports_first_failing_image() {
    let parallel = ImagePreprocessor::from_json(&model_config("nearest", true)).unwrap();
    let blobs = vec![
        solid_rgb(4, 4, [0, 0, 0]),
        b"bad".to_vec(),
        b"also bad".to_vec(),
    ];
    match parallel.process(&request_all(blobs)) {
        Err(PreprocessError::Decode { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected decode error, got {other:?}"),
    }
}

#[test]
fn execute_answers_each_request() {
    let first = InferenceRequest::new("a")
        .with_input(Tensor::from_blobs("input", vec![solid_rgb(2240, 1920, [5, 5, 5])]))
        .with_requested_output("output")
        .with_requested_output("scale");
    let second = InferenceRequest::new("b")
        .with_input(Tensor::from_blobs("input", Vec::new()))
        .with_requested_output("output");

    let responses = preprocessor().execute(&[first, second]).unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(fp64(responses[0].output("scale").unwrap()), &[1.0, 1.0]);

    let empty = responses[1].output("output").unwrap();
    assert_eq!(empty.shape, vec![0, 3, 1920, 2240]);
    assert!(empty.data.is_empty());
}
