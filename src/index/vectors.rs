use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use super::Metric;
use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"FSVEC\0\0\x01";
const HEADER_LEN: u64 = 16;

/// 只追加的向量文件
///
/// 文件头为 8 字节魔数、`u32` 维度和 `u32` 距离类型，之后是按行排列的 `f32` 向量，
/// 向量的行号即为其 ID
pub struct VectorFile {
    file: File,
    dim: usize,
    rows: u64,
}

impl VectorFile {
    /// 打开或创建向量文件，返回文件句柄和全部向量数据
    ///
    /// 末尾存在不完整的行时返回 [`Error::CorruptIndex`]
    pub fn open(path: impl AsRef<Path>, dim: usize, metric: Metric) -> Result<(Self, Vec<f32>)> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            info!("创建向量文件: {}", path.display());
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&(dim as u32).to_le_bytes());
            header.extend_from_slice(&metric.code().to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            return Ok((Self { file, dim, rows: 0 }, vec![]));
        }

        Self::check_header(&mut file, path, dim, metric)?;

        let row_bytes = Self::row_bytes(dim);
        let body = len - HEADER_LEN;
        if body % row_bytes != 0 {
            return Err(Error::CorruptIndex(format!(
                "向量文件末尾存在不完整的行: {} 字节",
                body % row_bytes
            )));
        }

        let mut bytes = Vec::with_capacity(body as usize);
        file.read_to_end(&mut bytes)?;
        let data = bytemuck::pod_collect_to_vec::<u8, f32>(&bytes);
        let rows = body / row_bytes;
        debug!("读取 {} 条向量: {}", rows, path.display());

        Ok((Self { file, dim, rows }, data))
    }

    fn row_bytes(dim: usize) -> u64 {
        (dim * size_of::<f32>()) as u64
    }

    /// 校验文件头，读取位置停在第一行向量的开头
    fn check_header(file: &mut File, path: &Path, dim: usize, metric: Metric) -> Result<()> {
        if file.metadata()?.len() < HEADER_LEN {
            return Err(Error::CorruptIndex(format!("文件头不完整: {}", path.display())));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[..8] != MAGIC {
            return Err(Error::CorruptIndex(format!("未知的文件格式: {}", path.display())));
        }
        let file_dim = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let file_metric = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if file_dim != dim {
            return Err(Error::DimensionMismatch { expected: file_dim, actual: dim });
        }
        if file_metric != metric.code() {
            return Err(Error::CorruptIndex(format!(
                "距离类型不一致: 文件为 {}，配置为 {metric}",
                Metric::from_code(file_metric).map_or("unknown", |m| m.as_str()),
            )));
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// 追加一行并落盘，返回行号
    pub fn append(&mut self, vector: &[f32]) -> Result<u64> {
        debug_assert_eq!(vector.len(), self.dim);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytemuck::cast_slice(vector))?;
        self.file.sync_data()?;
        let row = self.rows;
        self.rows += 1;
        Ok(row)
    }

    /// 截断到指定行数，用于回滚失败的写入以及修复
    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        self.file.set_len(HEADER_LEN + rows * Self::row_bytes(self.dim))?;
        self.file.sync_all()?;
        self.rows = rows;
        Ok(())
    }

    /// 丢弃末尾不完整的行，文件头与参数不一致时不做任何修改
    pub fn truncate_partial(path: impl AsRef<Path>, dim: usize, metric: Metric) -> Result<u64> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(0);
        }
        Self::check_header(&mut file, path, dim, metric)?;
        let row_bytes = Self::row_bytes(dim);
        let rows = (len - HEADER_LEN) / row_bytes;
        let partial = (len - HEADER_LEN) % row_bytes;
        if partial != 0 {
            info!("丢弃向量文件末尾 {} 字节", partial);
            file.set_len(HEADER_LEN + rows * row_bytes)?;
            file.sync_all()?;
        }
        Ok(partial)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let (mut file, data) = VectorFile::open(&path, 3, Metric::L2sq).unwrap();
        assert!(data.is_empty());
        assert_eq!(file.append(&[1.0, 2.0, 3.0]).unwrap(), 0);
        assert_eq!(file.append(&[4.0, 5.0, 6.0]).unwrap(), 1);
        drop(file);

        let (file, data) = VectorFile::open(&path, 3, Metric::L2sq).unwrap();
        assert_eq!(file.rows(), 2);
        assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_header_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        drop(VectorFile::open(&path, 4, Metric::Cosine).unwrap());

        assert!(matches!(
            VectorFile::open(&path, 8, Metric::Cosine),
            Err(Error::DimensionMismatch { expected: 4, actual: 8 })
        ));
        assert!(matches!(VectorFile::open(&path, 4, Metric::L2sq), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn test_partial_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let (mut file, _) = VectorFile::open(&path, 2, Metric::L2sq).unwrap();
        file.append(&[1.0, 1.0]).unwrap();
        drop(file);

        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[0u8; 3]).unwrap();
        drop(raw);

        assert!(matches!(VectorFile::open(&path, 2, Metric::L2sq), Err(Error::CorruptIndex(_))));
        // 维度不符时不截断
        assert!(VectorFile::truncate_partial(&path, 4, Metric::L2sq).is_err());
        assert_eq!(VectorFile::truncate_partial(&path, 2, Metric::L2sq).unwrap(), 3);
        let (file, data) = VectorFile::open(&path, 2, Metric::L2sq).unwrap();
        assert_eq!(file.rows(), 1);
        assert_eq!(data, vec![1.0, 1.0]);
    }
}
