//! 图片指纹：内容哈希 + 均值哈希 + 感知哈希
//!
//! 内容哈希用于精确去重，两种感知哈希用于近似重复检测和搜索结果佐证。

use std::f64::consts::PI;
use std::sync::LazyLock;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hamming::{encode_hex, hamming_distance};

/// 感知哈希边长，哈希位数为 HASH_SIZE * HASH_SIZE
pub const HASH_SIZE: usize = 8;
/// 感知哈希位数
pub const HASH_BITS: u32 = (HASH_SIZE * HASH_SIZE) as u32;
/// pHash 做 DCT 前的缩放边长
const DCT_SIZE: usize = 32;
/// 默认的 pHash 佐证阈值
pub const DEFAULT_PHASH_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFingerprint {
    /// blake3 内容哈希，256 位
    pub content_hash: String,
    /// 均值哈希
    pub average_hash: String,
    /// 基于 DCT 的感知哈希
    pub perceptual_hash: String,
}

impl ImageFingerprint {
    /// 两张图片感知哈希的汉明距离
    pub fn perceptual_distance(&self, other: &Self) -> Result<u32> {
        hamming_distance(&self.perceptual_hash, &other.perceptual_hash)
    }

    /// 两张图片均值哈希的汉明距离
    pub fn average_distance(&self, other: &Self) -> Result<u32> {
        hamming_distance(&self.average_hash, &other.average_hash)
    }
}

/// 计算图片字节的指纹
///
/// 解码失败返回 [`Error::Decode`](crate::Error::Decode)，其余情况总能得到完整指纹
pub fn fingerprint(data: &[u8]) -> Result<ImageFingerprint> {
    let content_hash = blake3::hash(data).to_hex().to_string();
    let img = image::load_from_memory(data)?;
    Ok(ImageFingerprint {
        content_hash,
        average_hash: average_hash(&img),
        perceptual_hash: perceptual_hash(&img),
    })
}

/// aHash：缩放到 8x8 灰度图，像素大于均值记 1
pub fn average_hash(img: &DynamicImage) -> String {
    let gray = normalize(img, HASH_SIZE);
    let pixels = gray.as_raw();
    let mean = pixels.iter().map(|&p| p as u32).sum::<u32>() as f64 / pixels.len() as f64;
    pack_bits(pixels.iter().map(|&p| p as f64 > mean))
}

/// pHash：缩放到 32x32 灰度图做二维 DCT，取左上角 8x8 低频块，与中位数比较
///
/// 直流分量不参与中位数计算，对应位固定为 0
pub fn perceptual_hash(img: &DynamicImage) -> String {
    let gray = normalize(img, DCT_SIZE);
    let input = gray.as_raw().iter().map(|&p| p as f64).collect::<Vec<_>>();
    let coeffs = dct_2d_low(&input);

    // 去掉直流分量后剩 63 个系数，中位数恰好是排序后的第 31 个
    let mut ac = coeffs[1..].to_vec();
    ac.sort_unstable_by(f64::total_cmp);
    let median = ac[ac.len() / 2];

    pack_bits(coeffs.iter().enumerate().map(|(i, &c)| i != 0 && c > median))
}

/// 灰度化并缩放到固定尺寸
fn normalize(img: &DynamicImage, size: usize) -> GrayImage {
    img.resize_exact(size as u32, size as u32, FilterType::Triangle).to_luma8()
}

/// DCT-II 余弦表，COS_TABLE[u][x] = cos((2x + 1) * u * PI / 2N)
static COS_TABLE: LazyLock<Vec<[f64; DCT_SIZE]>> = LazyLock::new(|| {
    (0..HASH_SIZE)
        .map(|u| {
            let mut row = [0.; DCT_SIZE];
            for (x, v) in row.iter_mut().enumerate() {
                *v = ((2 * x + 1) as f64 * u as f64 * PI / (2 * DCT_SIZE) as f64).cos();
            }
            row
        })
        .collect()
});

/// 二维 DCT-II，只计算 HASH_SIZE x HASH_SIZE 的低频部分，按行优先返回
///
/// 先对每一行做一维变换，再对结果的每一列做一维变换，省略了归一化系数，
/// 因为比较的是相对中位数的大小关系
fn dct_2d_low(input: &[f64]) -> Vec<f64> {
    debug_assert_eq!(input.len(), DCT_SIZE * DCT_SIZE);

    // rows[y][v]：第 y 行的第 v 个频率分量
    let rows = input
        .chunks_exact(DCT_SIZE)
        .map(|row| {
            let mut out = [0.; HASH_SIZE];
            for (v, o) in out.iter_mut().enumerate() {
                *o = row.iter().zip(&COS_TABLE[v]).map(|(p, c)| p * c).sum();
            }
            out
        })
        .collect::<Vec<_>>();

    let mut out = Vec::with_capacity(HASH_SIZE * HASH_SIZE);
    for u in 0..HASH_SIZE {
        for v in 0..HASH_SIZE {
            out.push(rows.iter().zip(&COS_TABLE[u]).map(|(r, c)| r[v] * c).sum());
        }
    }
    out
}

/// 高位在前打包为十六进制
fn pack_bits(bits: impl Iterator<Item = bool>) -> String {
    let mut bytes = vec![0u8; (HASH_BITS / 8) as usize];
    for (i, bit) in bits.enumerate() {
        if bit {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    encode_hex(&bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Luma, RgbImage, imageops};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::Error;

    /// 左暗右亮的平滑合成图，invert 为 true 时整体反相，即左亮右暗
    fn scene(width: u32, height: u32, invert: bool) -> DynamicImage {
        let img = GrayImage::from_fn(width, height, |x, y| {
            let (u, v) = (x as f64 / width as f64, y as f64 / height as f64);
            let mut p = 128. + 50. * (3. * PI * u + 0.3).sin() * (2. * PI * v).cos() + 30. * (u - v);
            p += if u < 0.5 { -50. } else { 50. };
            if invert {
                p = 255. - p;
            }
            Luma([p.round().clamp(0., 255.) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    /// 随机色块放大后再模糊，接近真实照片的纹理
    fn texture(seed: u64, width: u32, height: u32) -> DynamicImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let blocks = GrayImage::from_fn(16, 12, |_, _| Luma([rng.random::<u8>()]));
        let img = imageops::resize(&blocks, width, height, FilterType::Triangle);
        DynamicImage::ImageLuma8(imageops::blur(&img, 3.0))
    }

    fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(vec![]);
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_deterministic() {
        let data = encode(&scene(64, 48, false), ImageFormat::Png);
        assert_eq!(fingerprint(&data).unwrap(), fingerprint(&data).unwrap());
    }

    #[test]
    fn test_hash_width() {
        let fp = fingerprint(&encode(&scene(64, 48, false), ImageFormat::Png)).unwrap();
        assert_eq!(fp.content_hash.len(), 64);
        assert_eq!(fp.average_hash.len(), 16);
        assert_eq!(fp.perceptual_hash.len(), 16);
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(42)]
    fn test_near_duplicate(#[case] seed: u64) {
        let orig = texture(seed, 256, 192);
        let fp1 = fingerprint(&encode(&orig, ImageFormat::Png)).unwrap();

        // 轻微裁剪后重新编码为 jpeg
        let cropped = orig.crop_imm(2, 2, 252, 188);
        let fp2 = fingerprint(&encode(&DynamicImage::ImageRgb8(cropped.to_rgb8()), ImageFormat::Jpeg))
            .unwrap();

        assert_ne!(fp1.content_hash, fp2.content_hash);
        assert!(fp1.perceptual_distance(&fp2).unwrap() <= DEFAULT_PHASH_THRESHOLD);

        // 不同的纹理不能互相印证
        let other = fingerprint(&encode(&texture(seed + 1000, 256, 192), ImageFormat::Png)).unwrap();
        assert!(fp1.perceptual_distance(&other).unwrap() > DEFAULT_PHASH_THRESHOLD);
    }

    #[test]
    fn test_inverted_halves_differ() {
        let fp1 = fingerprint(&encode(&scene(128, 128, false), ImageFormat::Png)).unwrap();
        let fp2 = fingerprint(&encode(&scene(128, 128, true), ImageFormat::Png)).unwrap();
        assert!(fp1.perceptual_distance(&fp2).unwrap() > 16);
        assert!(fp1.average_distance(&fp2).unwrap() > 16);
    }

    #[test]
    fn test_color_and_gray_agree() {
        let gray = scene(64, 64, false);
        let luma = gray.to_luma8();
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let v = luma.get_pixel(x, y).0[0];
            image::Rgb([v, v, v])
        }));
        assert_eq!(average_hash(&gray), average_hash(&rgb));
    }

    #[test]
    fn test_decode_error() {
        assert!(matches!(fingerprint(b"definitely not an image"), Err(Error::Decode(_))));
        assert!(matches!(fingerprint(&[]), Err(Error::Decode(_))));
    }
}
