#![allow(dead_code)]

use std::f64::consts::PI;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use faceseek::db::init_db;
use faceseek::embed::Embedder;
use faceseek::fingerprint::average_hash;
use faceseek::hamming::decode_hex;
use faceseek::index::{FaceIndex, Metric};
use faceseek::{FaceDB, Result};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};

pub const DIM: usize = 64;

/// 把 aHash 的每一位展开为 ±1，相似的图片得到相近的向量
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    fn model_version(&self) -> &str {
        "ahash-test"
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>> {
        let img = image::load_from_memory(image)?;
        let bytes = decode_hex(&average_hash(&img))?;
        Ok((0..DIM).map(|i| if (bytes[i / 8] >> (7 - i % 8)) & 1 == 1 { 1.0 } else { -1.0 }).collect())
    }
}

/// 生成一张平滑的测试图片，`seed` 不同则内容不同
pub fn scene(seed: u32) -> Vec<u8> {
    let (w, h) = (64, 48);
    let fx = 1. + (seed % 4) as f64;
    let fy = 1. + (seed / 4 % 4) as f64;
    let img = GrayImage::from_fn(w, h, |x, y| {
        let (u, v) = (x as f64 / w as f64, y as f64 / h as f64);
        let p = 128. + 60. * (fx * PI * u).sin() * (fy * PI * v).cos() + (seed / 16) as f64;
        Luma([p.round().clamp(0., 255.) as u8])
    });
    encode(img)
}

/// `scene(seed)` 的反色版本
pub fn inverted(seed: u32) -> Vec<u8> {
    let mut img = image::load_from_memory(&scene(seed)).unwrap().to_luma8();
    img.pixels_mut().for_each(|p| p.0[0] = 255 - p.0[0]);
    encode(img)
}

fn encode(img: GrayImage) -> Vec<u8> {
    let mut buf = Cursor::new(vec![]);
    DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub async fn open_index(dir: &Path) -> Result<FaceIndex> {
    let db = init_db(dir.join("faceseek.db")).await?;
    FaceIndex::open(db, dir.join("vectors.bin"), DIM, Metric::Cosine).await
}

pub async fn open_facedb(dir: &Path) -> Result<FaceDB> {
    FaceDB::new(open_index(dir).await?, Arc::new(HashEmbedder), 10)
}
