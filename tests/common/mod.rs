//! Shared fixtures for integration tests
#![allow(dead_code)]

use base64::Engine;
use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use lama_worker::{
    Device, InpaintError, InpaintPipeline, Inpainter, ResourceLimits, ResourceManager, Result,
};
use ndarray::Array4;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Paints every hole pixel with a constant value
pub struct FillInpainter {
    pub fill: f32,
    pub calls: AtomicUsize,
}

impl FillInpainter {
    pub fn white() -> Self {
        Self {
            fill: 1.0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Inpainter for FillInpainter {
    fn inpaint(&self, image: Array4<f32>, mask: Array4<f32>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = image;
        for ((_, _, y, x), v) in out.indexed_iter_mut() {
            if mask[[0, 0, y, x]] > 0.5 {
                *v = self.fill;
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "stub-fill"
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Always fails the forward pass
pub struct FailingInpainter;

impl Inpainter for FailingInpainter {
    fn inpaint(&self, _image: Array4<f32>, _mask: Array4<f32>) -> Result<Array4<f32>> {
        Err(InpaintError::Model("CUDA out of memory".to_string()))
    }

    fn name(&self) -> &str {
        "stub-failing"
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Panics inside the forward pass
pub struct PanickingInpainter;

impl Inpainter for PanickingInpainter {
    fn inpaint(&self, _image: Array4<f32>, _mask: Array4<f32>) -> Result<Array4<f32>> {
        panic!("kernel exploded");
    }

    fn name(&self) -> &str {
        "stub-panicking"
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

pub fn pipeline_with(inpainter: Arc<dyn Inpainter>, max_size: u32) -> InpaintPipeline {
    let resources = Arc::new(ResourceManager::new(ResourceLimits::default()));
    InpaintPipeline::new(inpainter, resources, max_size, Duration::from_secs(5)).unwrap()
}

pub fn gray_image(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

/// Mask with the left half marked as hole
pub fn left_half_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

pub fn png_bytes(img: image::DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn rgb_base64(img: RgbImage) -> String {
    base64::engine::general_purpose::STANDARD.encode(png_bytes(img.into()))
}

pub fn mask_base64(mask: GrayImage) -> String {
    base64::engine::general_purpose::STANDARD.encode(png_bytes(mask.into()))
}

pub fn decode_output(image_base64: &str) -> RgbImage {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(image_base64)
        .unwrap();
    image::load_from_memory(&bytes).unwrap().to_rgb8()
}

/// Serve fixed bodies on an ephemeral port; returns the base URL
pub async fn spawn_static_server(routes: Vec<(&'static str, axum::http::StatusCode, Vec<u8>)>) -> String {
    let mut app = axum::Router::new();
    for (path, status, body) in routes {
        app = app.route(
            path,
            axum::routing::get(move || {
                let body = body.clone();
                async move { (status, body) }
            }),
        );
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
