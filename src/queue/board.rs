//! missions.md 看板：按小节组织任务，读-改-写在 fs2 排他锁下进行
//!
//! 未识别的小节、说明文字都原样保留；缺失的状态小节在需要时追加到文末。

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use fs2::FileExt;

use crate::fsutil::atomic_write;
use crate::queue::mission::{Mission, MissionStatus};
use crate::queue::QueueError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Item(Mission),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    heading: String,
    status: Option<MissionStatus>,
    entries: Vec<Entry>,
}

/// 解析后的看板文档
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MissionDocument {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

/// 各状态的任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

fn is_placeholder(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t == "(none)" || t == "none" || t == "(empty)"
}

impl MissionDocument {
    /// 只有四个空小节的新看板
    pub fn empty() -> Self {
        let mut doc = MissionDocument {
            preamble: vec!["# Missions".to_string(), String::new()],
            sections: Vec::new(),
        };
        for status in MissionStatus::ALL {
            doc.section_index(status);
        }
        doc
    }

    pub fn parse(text: &str) -> Self {
        let mut doc = MissionDocument::default();
        for line in text.lines() {
            if let Some(title) = line.strip_prefix("## ") {
                doc.sections.push(Section {
                    heading: line.to_string(),
                    status: MissionStatus::from_heading(title),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some(section) = doc.sections.last_mut() else {
                doc.preamble.push(line.to_string());
                continue;
            };

            match (section.status, line.strip_prefix("- ")) {
                (Some(status), Some(body)) if !is_placeholder(body) => {
                    section.entries.push(Entry::Item(Mission::parse(body, status)));
                }
                (Some(_), None)
                    if line.starts_with(char::is_whitespace) && !line.trim().is_empty() =>
                {
                    match section.entries.last_mut() {
                        Some(Entry::Item(m)) => m.details.push(line.to_string()),
                        _ => section.entries.push(Entry::Other(line.to_string())),
                    }
                }
                _ => section.entries.push(Entry::Other(line.to_string())),
            }
        }
        doc
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<String> = self.preamble.clone();
        for section in &self.sections {
            lines.push(section.heading.clone());
            for entry in &section.entries {
                match entry {
                    Entry::Item(m) => lines.extend(m.render()),
                    Entry::Other(l) => lines.push(l.clone()),
                }
            }
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    fn section_index(&mut self, status: MissionStatus) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.status == Some(status)) {
            return idx;
        }
        let needs_gap = self
            .sections
            .last()
            .and_then(|s| s.entries.last())
            .map_or(false, |e| !is_blank(e));
        if needs_gap {
            if let Some(last) = self.sections.last_mut() {
                last.entries.push(Entry::Other(String::new()));
            }
        }
        self.sections.push(Section {
            heading: format!("## {}", status.heading()),
            status: Some(status),
            entries: vec![Entry::Other(String::new())],
        });
        self.sections.len() - 1
    }

    /// 按文件顺序列出某状态的任务
    pub fn missions(&self, status: MissionStatus) -> Vec<&Mission> {
        self.sections
            .iter()
            .filter(|s| s.status == Some(status))
            .flat_map(|s| s.entries.iter())
            .filter_map(|e| match e {
                Entry::Item(m) => Some(m),
                Entry::Other(_) => None,
            })
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Mission> {
        MissionStatus::ALL
            .into_iter()
            .flat_map(|s| self.missions(s))
            .find(|m| m.id == id)
    }

    /// 队列顺序中最早的 pending 任务
    pub fn next_pending(&self) -> Option<&Mission> {
        self.missions(MissionStatus::Pending).into_iter().next()
    }

    pub fn counts(&self) -> BoardCounts {
        BoardCounts {
            pending: self.missions(MissionStatus::Pending).len(),
            in_progress: self.missions(MissionStatus::InProgress).len(),
            done: self.missions(MissionStatus::Done).len(),
            failed: self.missions(MissionStatus::Failed).len(),
        }
    }

    /// 只在 `from` 状态的小节里找：文本相同的任务共享 id，必须按状态区分
    fn take(&mut self, id: &str, from: MissionStatus) -> Result<Mission, QueueError> {
        for section in self.sections.iter_mut().filter(|s| s.status == Some(from)) {
            let pos = section
                .entries
                .iter()
                .position(|e| matches!(e, Entry::Item(m) if m.id == id));
            if let Some(pos) = pos {
                if let Entry::Item(mission) = section.entries.remove(pos) {
                    return Ok(mission);
                }
            }
        }
        match MissionStatus::ALL
            .into_iter()
            .find(|s| self.missions(*s).iter().any(|m| m.id == id))
        {
            Some(actual) => Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: actual,
                expected: from,
            }),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    /// 插到小节的第一个任务之前（不越过小节开头的说明文字）
    fn insert_front(&mut self, mission: Mission) {
        let idx = self.section_index(mission.status);
        let section = &mut self.sections[idx];
        section.entries.retain(|e| !is_placeholder_entry(e));
        let pos = section
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Item(_)))
            .unwrap_or_else(|| leading_blank_end(&section.entries));
        section.entries.insert(pos, Entry::Item(mission));
        self.keep_gap_after(idx);
    }

    /// 追加到小节最后一个任务之后
    fn insert_back(&mut self, mission: Mission) {
        let idx = self.section_index(mission.status);
        let section = &mut self.sections[idx];
        section.entries.retain(|e| !is_placeholder_entry(e));
        let pos = section
            .entries
            .iter()
            .rposition(|e| matches!(e, Entry::Item(_)))
            .map(|p| p + 1)
            .unwrap_or_else(|| leading_blank_end(&section.entries));
        section.entries.insert(pos, Entry::Item(mission));
        self.keep_gap_after(idx);
    }

    /// 非末尾小节以空行结束，避免与下一个标题粘在一起
    fn keep_gap_after(&mut self, idx: usize) {
        if idx + 1 >= self.sections.len() {
            return;
        }
        let section = &mut self.sections[idx];
        if section.entries.last().map_or(false, |e| !is_blank(e)) {
            section.entries.push(Entry::Other(String::new()));
        }
    }

    /// pending -> in-progress，写入 ▶ 与认领者
    pub fn claim(&mut self, id: &str, owner: &str, now: NaiveDateTime) -> Result<Mission, QueueError> {
        let mut mission = self.take(id, MissionStatus::Pending)?;
        mission.mark_started(now, owner);
        self.insert_back(mission.clone());
        Ok(mission)
    }

    pub fn complete(&mut self, id: &str, now: NaiveDateTime) -> Result<Mission, QueueError> {
        let mut mission = self.take(id, MissionStatus::InProgress)?;
        mission.mark_done(now);
        self.insert_front(mission.clone());
        Ok(mission)
    }

    pub fn fail(&mut self, id: &str, now: NaiveDateTime) -> Result<Mission, QueueError> {
        let mut mission = self.take(id, MissionStatus::InProgress)?;
        mission.mark_failed(now);
        self.insert_front(mission.clone());
        Ok(mission)
    }

    /// in-progress -> pending（放到队首，下次优先执行）
    pub fn release(&mut self, id: &str) -> Result<Mission, QueueError> {
        let mut mission = self.take(id, MissionStatus::InProgress)?;
        mission.mark_released();
        self.insert_front(mission.clone());
        Ok(mission)
    }

    fn release_where<F>(&mut self, pred: F) -> Vec<Mission>
    where
        F: Fn(&Mission) -> bool,
    {
        let ids: Vec<String> = self
            .missions(MissionStatus::InProgress)
            .into_iter()
            .filter(|m| pred(m))
            .map(|m| m.id.clone())
            .collect();
        // 逆序插到队首，保持原来的相对顺序
        let mut released: Vec<Mission> = ids
            .iter()
            .rev()
            .filter_map(|id| self.release(id).ok())
            .collect();
        released.reverse();
        released
    }

    /// 启动恢复：本机或无主的 in-progress 任务回到 pending
    pub fn recover(&mut self, owner: &str) -> Vec<Mission> {
        self.release_where(|m| m.owner.as_deref().map_or(true, |o| o == owner))
    }

    /// 回收认领超过 ttl 的任务（任何认领者）
    pub fn reclaim_stale(&mut self, now: NaiveDateTime, ttl: Duration) -> Vec<Mission> {
        self.release_where(|m| m.started_at.map_or(false, |t| now - t > ttl))
    }

    /// 新任务追加到 pending 末尾，带入队戳记
    pub fn add_pending(&mut self, text: &str, now: NaiveDateTime) -> Mission {
        let mut mission = Mission::parse(text, MissionStatus::Pending);
        mission.stamp_queued(now);
        self.insert_back(mission.clone());
        mission
    }
}

fn is_blank(entry: &Entry) -> bool {
    matches!(entry, Entry::Other(l) if l.trim().is_empty())
}

fn is_placeholder_entry(entry: &Entry) -> bool {
    matches!(entry, Entry::Other(l) if l.strip_prefix("- ").map_or(false, is_placeholder))
}

/// 空小节里的插入点：紧跟在标题下的空行之后
fn leading_blank_end(entries: &[Entry]) -> usize {
    match entries.first() {
        Some(e) if is_blank(e) => 1,
        _ => 0,
    }
}

/// missions.md 文件句柄
#[derive(Debug, Clone)]
pub struct MissionBoard {
    path: PathBuf,
}

impl MissionBoard {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// 创建带四个空小节的看板（已存在则不动）
    pub fn init(&self) -> Result<(), QueueError> {
        if self.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &MissionDocument::empty().render())?;
        Ok(())
    }

    pub fn load(&self) -> Result<MissionDocument, QueueError> {
        if !self.exists() {
            return Err(QueueError::Missing(self.path.clone()));
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(MissionDocument::parse(&text))
    }

    /// 跨进程锁文件：与看板同目录的 `.missions.md.lock`
    pub fn lock_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "missions.md".to_string());
        self.path.with_file_name(format!(".{}.lock", name))
    }

    /// 加锁读-改-写；文档未变化时不写回，变化时整文件原子替换
    pub fn update<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut MissionDocument) -> Result<T, QueueError>,
    {
        if !self.exists() {
            return Err(QueueError::Missing(self.path.clone()));
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;

        let result = (|| -> Result<T, QueueError> {
            let text = std::fs::read_to_string(&self.path)?;
            let mut doc = MissionDocument::parse(&text);
            let before = doc.clone();
            let value = f(&mut doc)?;
            if doc != before {
                atomic_write(&self.path, &doc.render())?;
            }
            Ok(value)
        })();

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to unlock mission board");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const BOARD: &str = "# Missions

Notes for the operator stay here.

## Pending

- [project:web] fix the login form
- write release notes ⏳(2026-02-12T04:00)

## In Progress

- (none)

## Ideas

- something for later

## Done

- old thing ✅ (2026-02-11 10:00)
";

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_render_preserves_unknown_content() {
        let doc = MissionDocument::parse(BOARD);
        assert_eq!(doc.render(), BOARD);
        assert_eq!(doc.counts().pending, 2);
        assert_eq!(doc.counts().in_progress, 0);
        assert_eq!(doc.counts().done, 1);
    }

    #[test]
    fn test_next_pending_is_queue_order() {
        let doc = MissionDocument::parse(BOARD);
        let next = doc.next_pending().unwrap();
        assert_eq!(next.description, "fix the login form");
        assert_eq!(next.context.project.as_deref(), Some("web"));
    }

    #[test]
    fn test_claim_then_complete() {
        let mut doc = MissionDocument::parse(BOARD);
        let id = doc.next_pending().unwrap().id.clone();

        let claimed = doc.claim(&id, "box1", at(5, 0)).unwrap();
        assert_eq!(claimed.status, MissionStatus::InProgress);
        assert_eq!(doc.missions(MissionStatus::InProgress).len(), 1);
        assert_eq!(doc.counts().pending, 1);
        assert!(doc.render().contains("▶(2026-02-12T05:00) [owner:box1]"));

        // 已被认领的任务不能再次认领
        assert!(matches!(
            doc.claim(&id, "box2", at(5, 1)),
            Err(QueueError::InvalidTransition { .. })
        ));

        doc.complete(&id, at(5, 30)).unwrap();
        let done = doc.missions(MissionStatus::Done);
        assert_eq!(done[0].id, id);
        assert_eq!(done.len(), 2);
        assert_eq!(doc.counts().in_progress, 0);
    }

    #[test]
    fn test_fail_creates_missing_section() {
        let mut doc = MissionDocument::parse(BOARD);
        let id = doc.next_pending().unwrap().id.clone();
        doc.claim(&id, "box1", at(5, 0)).unwrap();
        doc.fail(&id, at(5, 10)).unwrap();

        let text = doc.render();
        assert!(text.contains("## Failed"));
        assert!(text.contains("❌ (2026-02-12 05:10)"));
        assert_eq!(MissionDocument::parse(&text).counts().failed, 1);
    }

    #[test]
    fn test_release_goes_to_front() {
        let mut doc = MissionDocument::parse(BOARD);
        let second = doc.missions(MissionStatus::Pending)[1].id.clone();
        doc.claim(&second, "box1", at(5, 0)).unwrap();
        doc.release(&second).unwrap();
        assert_eq!(doc.next_pending().unwrap().id, second);
    }

    #[test]
    fn test_recover_own_and_unowned_only() {
        let text = "## Pending\n\n## In Progress\n\n- mine ▶(2026-02-12T04:00) [owner:box1]\n- theirs ▶(2026-02-12T04:00) [owner:box2]\n- orphan\n";
        let mut doc = MissionDocument::parse(text);
        let recovered = doc.recover("box1");
        let names: Vec<&str> = recovered.iter().map(|m| m.description.as_str()).collect();
        assert_eq!(names, vec!["mine", "orphan"]);
        assert_eq!(doc.missions(MissionStatus::InProgress)[0].description, "theirs");
        assert_eq!(doc.next_pending().unwrap().description, "mine");
    }

    #[test]
    fn test_reclaim_stale_claims() {
        let text = "## Pending\n\n## In Progress\n\n- old ▶(2026-02-12T01:00) [owner:box2]\n- fresh ▶(2026-02-12T04:50) [owner:box2]\n";
        let mut doc = MissionDocument::parse(text);
        let reclaimed = doc.reclaim_stale(at(5, 0), Duration::hours(2));
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].description, "old");
        assert_eq!(doc.counts().in_progress, 1);
    }

    #[test]
    fn test_add_pending_removes_placeholder() {
        let mut doc = MissionDocument::parse("## Pending\n\n- (none)\n\n## Done\n");
        let m = doc.add_pending("[project:api] add rate limit", at(6, 0));
        assert_eq!(m.queued_at, Some(at(6, 0)));
        let text = doc.render();
        assert!(!text.contains("(none)"));
        assert!(text.contains("- [project:api] add rate limit ⏳(2026-02-12T06:00)"));
    }

    #[test]
    fn test_identical_text_closes_the_claimed_copy() {
        let mut doc = MissionDocument::parse(
            "# Missions\n\n## Pending\n\n- run tests\n- run tests\n\n## In Progress\n\n## Done\n\n## Failed\n",
        );
        let id = doc.next_pending().unwrap().id.clone();
        doc.claim(&id, "box1", at(5, 0)).unwrap();
        doc.complete(&id, at(5, 30)).unwrap();

        let c = doc.counts();
        assert_eq!((c.pending, c.in_progress, c.done), (1, 0, 1));

        doc.claim(&id, "box1", at(6, 0)).unwrap();
        doc.fail(&id, at(6, 30)).unwrap();
        let c = doc.counts();
        assert_eq!((c.pending, c.in_progress, c.done, c.failed), (0, 0, 1, 1));
    }

    #[test]
    fn test_repeat_of_done_mission_can_be_claimed() {
        let mut doc = MissionDocument::parse(
            "# Missions\n\n## Done\n\n- run tests ✅ (2026-02-11 10:00)\n\n## Pending\n\n- run tests\n",
        );
        let id = doc.next_pending().unwrap().id.clone();
        assert_eq!(doc.missions(MissionStatus::Done)[0].id, id);

        let claimed = doc.claim(&id, "box1", at(5, 0)).unwrap();
        assert_eq!(claimed.status, MissionStatus::InProgress);
        assert_eq!(doc.counts().done, 1);
        assert_eq!(doc.counts().pending, 0);

        assert!(matches!(
            doc.release("ffffffff"),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_details_move_with_item() {
        let text = "## Pending\n\n- multi step\n  with a second line\n\n## In Progress\n";
        let mut doc = MissionDocument::parse(text);
        let id = doc.next_pending().unwrap().id.clone();
        doc.claim(&id, "box1", at(7, 0)).unwrap();
        let out = doc.render();
        let in_progress = out.split("## In Progress").nth(1).unwrap();
        assert!(in_progress.contains("  with a second line"));
    }

    #[test]
    fn test_board_file_update_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let board = MissionBoard::new(dir.path().join("missions.md"));
        assert!(matches!(board.load(), Err(QueueError::Missing(_))));

        board.init().unwrap();
        let added = board
            .update(|doc| Ok(doc.add_pending("tidy logs", at(8, 0))))
            .unwrap();
        let doc = board.load().unwrap();
        assert_eq!(doc.next_pending().unwrap().id, added.id);
    }

    #[cfg(unix)]
    #[test]
    fn test_update_replaces_board_file_whole() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missions.md");
        std::fs::write(&path, BOARD).unwrap();
        let board = MissionBoard::new(&path);
        let before = std::fs::metadata(&path).unwrap().ino();

        board
            .update(|doc| Ok(doc.add_pending("rotate keys", at(9, 0))))
            .unwrap();

        // 新内容通过 rename 落盘，原文件从未被截断
        assert_ne!(std::fs::metadata(&path).unwrap().ino(), before);
        assert!(board.lock_path().exists());
        assert_eq!(board.lock_path(), dir.path().join(".missions.md.lock"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(board.load().unwrap().counts().pending, 3);
    }

    #[test]
    fn test_unchanged_document_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missions.md");
        std::fs::write(&path, BOARD).unwrap();
        let board = MissionBoard::new(&path);
        let counts = board.update(|doc| Ok(doc.counts())).unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BOARD);
    }
}
