//! Fixtures shared by the unit tests: a loopback HTTP server and generated images.

use std::io::Cursor;
use std::path::Path;

use axum::Router;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio::net::TcpListener;

use crate::harvest::Configuration;

/// Serve `app` on an ephemeral loopback port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Configuration rooted in `root` and pointed at a local search endpoint.
pub fn test_config(root: &Path, base: &str) -> Configuration {
    let mut config = Configuration::default();
    config.paths.target_folder = root.to_path_buf();
    config.search.endpoint = format!("{}/images/async", base);
    config.search.origin = base.to_string();
    config.network.use_system_proxy = false;
    config.fetch.retry_backoff_ms = 10;
    config.fetch.timeout_secs = 5;
    config
}

/// A busy RGB pattern; JPEG cannot compress it much, so the body stays well above 2KB.
pub fn noise_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let seed = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503) ^ x.wrapping_mul(y);
        Rgb([(seed & 0xff) as u8, ((seed >> 8) & 0xff) as u8, ((seed >> 16) & 0xff) as u8])
    })
}

pub fn noise_jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(noise_image(width, height))
        .write_to(&mut bytes, ImageFormat::Jpeg)
        .unwrap();
    bytes.into_inner()
}
