//! 收发件箱：outbox.md（给操作者的消息）与 inbox.md（聊天通道写入的指令）
//!
//! 追加与消费都在 fs2 锁下进行；消费只移除已经处理过的前缀，期间新追加的内容保留。

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub const OUTBOX_FILE: &str = "outbox.md";
pub const INBOX_FILE: &str = "inbox.md";

#[derive(Debug, Clone)]
pub struct Mailbox {
    path: PathBuf,
}

impl Mailbox {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn outbox(root: &Path) -> Self {
        Self::new(root.join(OUTBOX_FILE))
    }

    pub fn inbox(root: &Path) -> Self {
        Self::new(root.join(INBOX_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = writeln!(file, "{}", message.trim_end());
        FileExt::unlock(&file)?;
        result
    }

    /// 当前内容（不存在时为空串）
    pub fn peek(&self) -> std::io::Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(t) => Ok(t),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// 移除已处理的前缀 `handled`
    pub fn consume(&self, handled: &str) -> std::io::Result<()> {
        if handled.is_empty() {
            return Ok(());
        }
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        file.lock_exclusive()?;
        let result = (|| -> std::io::Result<()> {
            let mut current = String::new();
            file.read_to_string(&mut current)?;
            let rest = current.strip_prefix(handled).unwrap_or(&current).to_string();
            if rest.len() == current.len() {
                return Ok(());
            }
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(rest.as_bytes())?;
            Ok(())
        })();
        FileExt::unlock(&file)?;
        result
    }
}
