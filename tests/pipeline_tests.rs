//! End-to-end tests of the job handler with a stub network

mod common;

use axum::http::StatusCode;
use common::*;
use lama_worker::{Feather, InpaintResponse};
use serde_json::json;
use std::sync::Arc;

fn unwrap_ok(response: InpaintResponse) -> (String, lama_worker::ResponseMetadata) {
    match response {
        InpaintResponse::Ok {
            image_base64,
            metadata,
        } => (image_base64, metadata),
        InpaintResponse::Error { message } => panic!("expected ok envelope, got error: {}", message),
    }
}

fn unwrap_err(response: InpaintResponse) -> String {
    match response {
        InpaintResponse::Error { message } => message,
        InpaintResponse::Ok { .. } => panic!("expected error envelope"),
    }
}

#[tokio::test]
async fn test_inpaints_hole_and_rounds_to_multiple_of_eight() {
    let inpainter = Arc::new(FillInpainter::white());
    let pipeline = pipeline_with(inpainter.clone(), 768);

    let event = json!({
        "id": "job-1",
        "input": {
            "image": rgb_base64(gray_image(100, 50, 128)),
            "mask": mask_base64(left_half_mask(100, 50)),
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.input_size, (100, 50));
    assert_eq!(metadata.output_size, (96, 48));
    assert_eq!(metadata.model, "stub-fill");
    assert_eq!(metadata.device, lama_worker::Device::Cpu);
    assert!(metadata.mask_processing.is_none());
    assert_eq!(inpainter.calls(), 1);

    let output = decode_output(&image_base64);
    assert_eq!(output.dimensions(), (96, 48));
    // Hole is filled, the rest is untouched
    assert_eq!(output.get_pixel(0, 0).0, [255, 255, 255]);
    let kept = output.get_pixel(95, 47).0[0];
    assert!((kept as i32 - 128).abs() <= 1, "got {}", kept);
}

#[tokio::test]
async fn test_large_input_is_capped_at_max_size() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(2000, 1000, 10)),
            "mask": mask_base64(left_half_mask(2000, 1000)),
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.input_size, (2000, 1000));
    assert_eq!(metadata.output_size, (768, 384));
    assert_eq!(decode_output(&image_base64).dimensions(), (768, 384));
}

#[tokio::test]
async fn test_request_max_size_narrows_worker_cap() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(400, 200, 10)),
            "mask": mask_base64(left_half_mask(400, 200)),
            "max_size": 128,
        }
    });

    let (_, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.output_size, (128, 64));
}

#[tokio::test]
async fn test_request_max_size_cannot_exceed_worker_cap() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 64);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(400, 200, 10)),
            "mask": mask_base64(left_half_mask(400, 200)),
            "max_size": 100000,
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.output_size, (64, 32));
    assert_eq!(decode_output(&image_base64).dimensions(), (64, 32));
}

#[tokio::test]
async fn test_accepts_data_url_and_mismatched_mask_size() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": format!("data:image/png;base64,{}", rgb_base64(gray_image(64, 64, 50))),
            // Mask at half resolution is stretched to the image size
            "mask": mask_base64(left_half_mask(32, 32)),
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.output_size, (64, 64));
    let output = decode_output(&image_base64);
    assert_eq!(output.get_pixel(0, 10).0, [255, 255, 255]);
    assert!(output.get_pixel(63, 10).0[0] < 60);
}

#[tokio::test]
async fn test_accepts_local_file_paths() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("image.png");
    let mask_path = dir.path().join("mask.png");
    std::fs::write(&image_path, png_bytes(gray_image(40, 24, 90).into())).unwrap();
    std::fs::write(&mask_path, png_bytes(left_half_mask(40, 24).into())).unwrap();

    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);
    let event = json!({
        "input": {
            "image": image_path.to_str().unwrap(),
            "mask": mask_path.to_str().unwrap(),
        }
    });

    let (_, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.output_size, (40, 24));
}

#[tokio::test]
async fn test_blur_edges_reports_mask_processing() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(64, 32, 0)),
            "mask": mask_base64(left_half_mask(64, 32)),
            "blur_edges": true,
            "blur_radius": 3,
            "feather_amount": 0.2,
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(
        metadata.mask_processing,
        Some(Feather {
            radius: 3.0,
            amount: 0.2
        })
    );

    let output = decode_output(&image_base64);
    // Inside the hole stays fully inpainted, far outside stays original
    assert_eq!(output.get_pixel(0, 16).0, [255, 255, 255]);
    assert_eq!(output.get_pixel(63, 16).0, [0, 0, 0]);
}

#[tokio::test]
async fn test_missing_fields_yield_error_envelope() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let message = unwrap_err(pipeline.handle(json!({})).await);
    assert!(message.contains("image"), "got {}", message);

    let message = unwrap_err(
        pipeline
            .handle(json!({"input": {"image": rgb_base64(gray_image(8, 8, 0))}}))
            .await,
    );
    assert!(message.contains("mask"), "got {}", message);

    let message = unwrap_err(pipeline.handle(json!("not an object")).await);
    assert!(message.contains("JSON object"), "got {}", message);
}

#[tokio::test]
async fn test_undecodable_payloads_yield_error_envelope() {
    let inpainter = Arc::new(FillInpainter::white());
    let pipeline = pipeline_with(inpainter.clone(), 768);

    let event = json!({"input": {"image": "%%%not base64%%%", "mask": "%%%"}});
    assert!(!pipeline.handle(event).await.is_ok());

    // Valid base64, but not an image
    let event = json!({"input": {"image": "aGVsbG8gd29ybGQ=", "mask": "aGVsbG8gd29ybGQ="}});
    assert!(!pipeline.handle(event).await.is_ok());

    assert_eq!(inpainter.calls(), 0);
}

#[tokio::test]
async fn test_too_small_image_is_rejected() {
    let inpainter = Arc::new(FillInpainter::white());
    let pipeline = pipeline_with(inpainter.clone(), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(4, 100, 0)),
            "mask": mask_base64(left_half_mask(4, 100)),
        }
    });

    let message = unwrap_err(pipeline.handle(event).await);
    assert!(message.contains("too small"), "got {}", message);
    assert_eq!(inpainter.calls(), 0);
}

#[tokio::test]
async fn test_model_failure_is_reported() {
    let pipeline = pipeline_with(Arc::new(FailingInpainter), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(16, 16, 0)),
            "mask": mask_base64(left_half_mask(16, 16)),
        }
    });

    let message = unwrap_err(pipeline.handle(event).await);
    assert!(message.contains("CUDA out of memory"), "got {}", message);
}

#[tokio::test]
async fn test_job_slot_is_released_after_each_job() {
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": rgb_base64(gray_image(16, 16, 0)),
            "mask": mask_base64(left_half_mask(16, 16)),
        }
    });

    assert!(pipeline.handle(event.clone()).await.is_ok());
    assert!(pipeline.handle(event).await.is_ok());

    let stats = pipeline.resources().get_stats();
    assert_eq!(stats.jobs_in_flight, 0);
    assert_eq!(stats.jobs_completed, 2);
}

#[tokio::test]
async fn test_fetches_image_and_mask_over_http() {
    let base = spawn_static_server(vec![
        ("/image.png", StatusCode::OK, png_bytes(gray_image(48, 32, 70).into())),
        ("/mask.png", StatusCode::OK, png_bytes(left_half_mask(48, 32).into())),
    ])
    .await;
    let pipeline = pipeline_with(Arc::new(FillInpainter::white()), 768);

    let event = json!({
        "input": {
            "image": format!("{}/image.png", base),
            "mask": format!("{}/mask.png", base),
        }
    });

    let (image_base64, metadata) = unwrap_ok(pipeline.handle(event).await);
    assert_eq!(metadata.input_size, (48, 32));
    let output = decode_output(&image_base64);
    assert_eq!(output.get_pixel(0, 0).0, [255, 255, 255]);
    assert_eq!(output.get_pixel(47, 0).0, [70, 70, 70]);
}

#[tokio::test]
async fn test_http_error_status_yields_error_envelope() {
    let base = spawn_static_server(vec![
        ("/image.png", StatusCode::OK, png_bytes(gray_image(16, 16, 0).into())),
        ("/mask.png", StatusCode::NOT_FOUND, Vec::new()),
    ])
    .await;
    let inpainter = Arc::new(FillInpainter::white());
    let pipeline = pipeline_with(inpainter.clone(), 768);

    let event = json!({
        "input": {
            "image": format!("{}/image.png", base),
            "mask": format!("{}/mask.png", base),
        }
    });

    let message = unwrap_err(pipeline.handle(event).await);
    assert!(message.contains("404"), "got {}", message);
    assert_eq!(inpainter.calls(), 0);
}
