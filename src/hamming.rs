use crate::error::{Error, Result};

/// 计算两段等长字节的汉明距离
#[inline(always)]
pub fn hamming(va: &[u8], vb: &[u8]) -> u32 {
    va.iter().zip(vb).map(|(a, b)| (a ^ b).count_ones()).sum()
}

/// 将十六进制哈希解析为字节
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::InvalidArgument(format!("十六进制长度必须为偶数: {s}")));
    }
    // from_str_radix 会接受 "+f" 这样的输入
    if !s.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidArgument(format!("无效的十六进制: {s}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|b| u8::from_str_radix(b, 16).ok())
                .ok_or_else(|| Error::InvalidArgument(format!("无效的十六进制: {s}")))
        })
        .collect()
}

/// 将字节编码为小写十六进制
pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// 计算两个十六进制哈希的汉明距离
///
/// 两个哈希必须等长，否则视为调用方错误
pub fn hamming_distance(a: &str, b: &str) -> Result<u32> {
    let (va, vb) = (decode_hex(a)?, decode_hex(b)?);
    if va.len() != vb.len() {
        return Err(Error::InvalidArgument(format!(
            "哈希长度不一致: {} != {}",
            a.len(),
            b.len()
        )));
    }
    Ok(hamming(&va, &vb))
}

/// 将汉明距离换算为 0 到 1 之间的相似度
pub fn similarity(distance: u32, bit_count: u32) -> f32 {
    if bit_count == 0 {
        return 0.;
    }
    (1. - distance as f32 / bit_count as f32).clamp(0., 1.)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_identical() {
        let va = [0u8; 8];
        let vb = [0u8; 8];
        assert_eq!(hamming(&va, &vb), 0);
    }

    #[test]
    fn test_hamming_all_different() {
        let va = [0u8; 8];
        let vb = [255u8; 8];
        assert_eq!(hamming(&va, &vb), 64);
    }

    #[test]
    fn test_hamming_distance_hex() {
        assert_eq!(hamming_distance("00ff", "00ff").unwrap(), 0);
        assert_eq!(hamming_distance("0000", "0001").unwrap(), 1);
        assert_eq!(hamming_distance("ffffffffffffffff", "0000000000000000").unwrap(), 64);
    }

    #[test]
    fn test_hamming_distance_invalid() {
        assert!(matches!(hamming_distance("00", "0000"), Err(Error::InvalidArgument(_))));
        assert!(matches!(hamming_distance("zz", "00"), Err(Error::InvalidArgument(_))));
        assert!(matches!(hamming_distance("0", "0"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0x7f, 0xa5, 0xff];
        assert_eq!(encode_hex(&bytes), "007fa5ff");
        assert_eq!(decode_hex("007fa5ff").unwrap(), bytes);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity(0, 64), 1.);
        assert_eq!(similarity(64, 64), 0.);
        assert_eq!(similarity(16, 64), 0.75);
        assert_eq!(similarity(100, 64), 0.);
        assert_eq!(similarity(0, 0), 0.);
    }
}
