use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// 流式读写的块大小
pub const CHUNK_SIZE: usize = 8192;

/// 增量 SHA256：数据分块到达时边收边算，结果与一次性 `hash_bytes` 相同
#[derive(Default)]
pub struct StreamingHash {
    hasher: Sha256,
    len: u64,
}

impl StreamingHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// 已处理的字节数
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// 内存中字节流的 SHA256 指纹（小写十六进制）
///
/// 用于结果去重与审计：同一份上传无论检测几次，media_hash 都一致。
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hash = StreamingHash::new();
    hash.update(data);
    hash.finalize()
}

/// 文件的 SHA256 指纹，按块读取，不把整个视频读进内存
pub fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = File::open(path)?;
    let mut hash = StreamingHash::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
    }

    Ok(hash.finalize())
}
