//! 有界输出捕获
//!
//! 只保留前 limit 字节，其余继续读出并丢弃（避免子进程因管道写满而阻塞），
//! 结束时追加截断标记。

use tokio::io::{AsyncRead, AsyncReadExt};

/// 捕获结果：保留的字节与被丢弃的字节数
#[derive(Debug, Default, Clone)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

impl Captured {
    /// 转为文本；有丢弃时追加 `...[truncated N bytes]`
    pub fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("...[truncated {} bytes]", self.dropped));
        }
        text
    }
}

/// 读到 EOF，最多保留 limit 字节
pub async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        let keep = room.min(n);
        captured.bytes.extend_from_slice(&buf[..keep]);
        captured.dropped += (n - keep) as u64;
    }
    Ok(captured)
}
