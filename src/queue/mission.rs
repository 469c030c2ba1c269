//! 任务条目：missions.md 中一行 `- ...` 的解析与生命周期戳记
//!
//! 行格式：`- [project:web] 修复构建 ⏳(2026-02-12T04:15) ▶(2026-02-12T04:20) [owner:host] ✅ (2026-02-12 04:30)`
//! 标签与戳记都是可选的，未知文本原样保留。

use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const STAMP_FMT: &str = "%Y-%m-%dT%H:%M";
const CLOSE_FMT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissionStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl MissionStatus {
    pub const ALL: [MissionStatus; 4] = [
        MissionStatus::Pending,
        MissionStatus::InProgress,
        MissionStatus::Done,
        MissionStatus::Failed,
    ];

    /// 对应的 markdown 小节标题
    pub fn heading(&self) -> &'static str {
        match self {
            MissionStatus::Pending => "Pending",
            MissionStatus::InProgress => "In Progress",
            MissionStatus::Done => "Done",
            MissionStatus::Failed => "Failed",
        }
    }

    /// 标题匹配（大小写不敏感）
    pub fn from_heading(title: &str) -> Option<Self> {
        let t = title.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|s| s.heading().to_lowercase() == t)
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MissionStatus::Pending => "pending",
            MissionStatus::InProgress => "in-progress",
            MissionStatus::Done => "done",
            MissionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 可选的结构化上下文
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionContext {
    pub project: Option<String>,
    pub path: Option<PathBuf>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mission {
    pub id: String,
    pub status: MissionStatus,
    pub description: String,
    pub context: MissionContext,
    pub owner: Option<String>,
    pub queued_at: Option<NaiveDateTime>,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    /// `- ` 之后的原始文本（含标签与戳记）
    pub text: String,
    /// 缩进的续行，随条目一起移动
    pub details: Vec<String>,
}

struct Patterns {
    queued: Regex,
    started: Regex,
    closed: Regex,
    owner: Regex,
    tag: Regex,
    any_stamp: Regex,
    any_close: Regex,
    any_start: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        queued: Regex::new(r"⏳\((\d{4}-\d{2}-\d{2}T\d{2}:\d{2})\)").unwrap(),
        started: Regex::new(r"▶\((\d{4}-\d{2}-\d{2}T\d{2}:\d{2})\)").unwrap(),
        closed: Regex::new(r"[✅❌] \((\d{4}-\d{2}-\d{2} \d{2}:\d{2})\)").unwrap(),
        owner: Regex::new(r"\s*\[owner:([^\]]*)\]").unwrap(),
        tag: Regex::new(r"\[(project|projet|path|priority):([^\]]+)\]").unwrap(),
        any_stamp: Regex::new(r"\s*[⏳▶]\([^)]*\)").unwrap(),
        any_close: Regex::new(r"\s*[✅❌] \([^)]*\)").unwrap(),
        any_start: Regex::new(r"\s*▶\([^)]*\)").unwrap(),
    })
}

fn capture_time(re: &Regex, text: &str, fmt: &str) -> Option<NaiveDateTime> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), fmt).ok())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 去掉生命周期戳记和认领者后的文本（用于计算稳定 id）
pub fn strip_lifecycle(text: &str) -> String {
    let p = patterns();
    let s = p.any_stamp.replace_all(text, "");
    let s = p.any_close.replace_all(&s, "");
    let s = p.owner.replace_all(&s, "");
    collapse_ws(&s)
}

/// 稳定的 8 位十六进制 id：同样的任务文本得到同样的 id
pub fn mission_id(text: &str) -> String {
    let base = strip_lifecycle(text);
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, base.as_bytes());
    uuid.simple().to_string()[..8].to_string()
}

impl Mission {
    pub fn parse(text: &str, status: MissionStatus) -> Self {
        let p = patterns();
        let text = text.trim().to_string();

        let mut context = MissionContext::default();
        for cap in p.tag.captures_iter(&text) {
            let value = cap[2].trim().to_string();
            match &cap[1] {
                "project" | "projet" => context.project = Some(value),
                "path" => context.path = Some(PathBuf::from(value)),
                "priority" => context.priority = Some(value),
                _ => {}
            }
        }

        let owner = p
            .owner
            .captures(&text)
            .map(|c| c[1].trim().to_string())
            .filter(|o| !o.is_empty());

        let stripped = strip_lifecycle(&text);
        let description = collapse_ws(&p.tag.replace_all(&stripped, ""));

        Self {
            id: mission_id(&text),
            status,
            description,
            context,
            owner,
            queued_at: capture_time(&p.queued, &text, STAMP_FMT),
            started_at: capture_time(&p.started, &text, STAMP_FMT),
            finished_at: capture_time(&p.closed, &text, CLOSE_FMT),
            text,
            details: Vec::new(),
        }
    }

    fn reparse(&mut self, text: String, status: MissionStatus) {
        let details = std::mem::take(&mut self.details);
        *self = Mission::parse(&text, status);
        self.details = details;
    }

    /// 入队戳记 ⏳，已有则不重复添加
    pub fn stamp_queued(&mut self, now: NaiveDateTime) {
        if self.queued_at.is_none() && !self.text.contains('⏳') {
            let text = format!("{} ⏳({})", self.text, now.format(STAMP_FMT));
            self.reparse(text, self.status);
        }
    }

    /// 认领：▶ 戳记 + 认领者
    pub fn mark_started(&mut self, now: NaiveDateTime, owner: &str) {
        let base = self.without_claim();
        let text = format!("{} ▶({}) [owner:{}]", base, now.format(STAMP_FMT), owner);
        self.reparse(text, MissionStatus::InProgress);
    }

    pub fn mark_done(&mut self, now: NaiveDateTime) {
        let text = format!("{} ✅ ({})", self.text, now.format(CLOSE_FMT));
        self.reparse(text, MissionStatus::Done);
    }

    pub fn mark_failed(&mut self, now: NaiveDateTime) {
        let text = format!("{} ❌ ({})", self.text, now.format(CLOSE_FMT));
        self.reparse(text, MissionStatus::Failed);
    }

    /// 放弃认领，回到 pending
    pub fn mark_released(&mut self) {
        let text = self.without_claim();
        self.reparse(text, MissionStatus::Pending);
    }

    fn without_claim(&self) -> String {
        let p = patterns();
        let s = p.owner.replace_all(&self.text, "");
        let s = p.any_start.replace_all(&s, "");
        collapse_ws(&s)
    }

    /// 写回 markdown 的行（含续行）
    pub fn render(&self) -> Vec<String> {
        let mut out = vec![format!("- {}", self.text)];
        out.extend(self.details.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_tags_and_stamps() {
        let m = Mission::parse(
            "[project:koan] [priority:high] fix bug ⏳(2026-02-12T04:15) ▶(2026-02-12T04:20) [owner:box1]",
            MissionStatus::InProgress,
        );
        assert_eq!(m.context.project.as_deref(), Some("koan"));
        assert_eq!(m.context.priority.as_deref(), Some("high"));
        assert_eq!(m.description, "fix bug");
        assert_eq!(m.owner.as_deref(), Some("box1"));
        assert_eq!(m.queued_at, Some(at(4, 15)));
        assert_eq!(m.started_at, Some(at(4, 20)));
        assert!(m.finished_at.is_none());
    }

    #[test]
    fn test_french_project_tag() {
        let m = Mission::parse("[projet:web] tidy css", MissionStatus::Pending);
        assert_eq!(m.context.project.as_deref(), Some("web"));
        assert_eq!(m.description, "tidy css");
    }

    #[test]
    fn test_malformed_stamps_ignored() {
        let m = Mission::parse("fix bug ⏳(not-a-date) ▶(also-bad)", MissionStatus::Pending);
        assert!(m.queued_at.is_none());
        assert!(m.started_at.is_none());
        assert_eq!(m.description, "fix bug");
    }

    #[test]
    fn test_id_is_stable_across_lifecycle() {
        let mut m = Mission::parse("[project:web] fix bug", MissionStatus::Pending);
        let id = m.id.clone();
        assert_eq!(id.len(), 8);

        m.stamp_queued(at(4, 0));
        assert_eq!(m.id, id);
        m.mark_started(at(4, 5), "box1");
        assert_eq!(m.id, id);
        assert_eq!(m.status, MissionStatus::InProgress);
        m.mark_done(at(4, 35));
        assert_eq!(m.id, id);
        assert_eq!(m.finished_at, Some(at(4, 35)));
        assert!(m.text.contains("✅ (2026-02-12 04:35)"));
    }

    #[test]
    fn test_release_strips_claim_but_keeps_queue_stamp() {
        let mut m = Mission::parse(
            "fix bug ⏳(2026-02-12T04:15) ▶(2026-02-12T04:20) [owner:box1]",
            MissionStatus::InProgress,
        );
        m.mark_released();
        assert_eq!(m.status, MissionStatus::Pending);
        assert_eq!(m.text, "fix bug ⏳(2026-02-12T04:15)");
        assert!(m.owner.is_none());
    }

    #[test]
    fn test_queue_stamp_not_duplicated() {
        let mut m = Mission::parse("fix bug ⏳(2026-02-12T04:00)", MissionStatus::Pending);
        m.stamp_queued(at(5, 0));
        assert_eq!(m.text.matches('⏳').count(), 1);
    }

    #[test]
    fn test_failed_stamp() {
        let mut m = Mission::parse("fix bug", MissionStatus::InProgress);
        m.mark_failed(at(4, 25));
        assert_eq!(m.status, MissionStatus::Failed);
        assert!(m.text.ends_with("❌ (2026-02-12 04:25)"));
    }

    #[test]
    fn test_heading_lookup() {
        assert_eq!(MissionStatus::from_heading("in progress"), Some(MissionStatus::InProgress));
        assert_eq!(MissionStatus::from_heading(" DONE "), Some(MissionStatus::Done));
        assert_eq!(MissionStatus::from_heading("Ideas"), None);
    }
}
