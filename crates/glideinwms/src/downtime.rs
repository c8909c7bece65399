//! Downtime windows of a Factory, kept in a plain text file.
//!
//! Every line describes one window:
//! `start end [entry [frontend [security_class [# comment]]]]`, where `start` and `end` are
//! RFC-3339 timestamps and `end` may be `None` for an open-ended window.
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use nix::fcntl::{Flock, FlockArg};

use crate::common::error::GwmsError;
use crate::common::utils::fs::write_atomic;

/// Wildcard for the entry, frontend and security class columns.
pub const ALL: &str = "All";
/// Entry column of windows that cover the whole Factory.
pub const FACTORY: &str = "factory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowntimePeriod {
    pub start: i64,
    pub end: Option<i64>,
    pub entry: String,
    pub frontend: String,
    pub security_class: String,
    pub comment: Option<String>,
}

pub fn format_time(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).single() {
        Some(time) => time.to_rfc3339_opts(SecondsFormat::Secs, false),
        None => epoch.to_string(),
    }
}

pub fn parse_time(value: &str) -> crate::Result<i64> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|time| time.timestamp())
        .map_err(|error| GwmsError::GenericError(format!("Invalid time `{value}`: {error}")))
}

impl DowntimePeriod {
    pub fn new(start: i64, end: Option<i64>) -> Self {
        Self {
            start,
            end,
            entry: FACTORY.to_string(),
            frontend: ALL.to_string(),
            security_class: ALL.to_string(),
            comment: None,
        }
    }

    /// Parses one line; comments and blank lines yield `None`.
    pub fn parse_line(line: &str) -> crate::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (fields, comment) = match line.split_once('#') {
            Some((fields, comment)) => (fields, Some(comment.trim().to_string())),
            None => (line, None),
        };
        let fields: Vec<&str> = fields.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(GwmsError::GenericError(format!(
                "Expected at least a start and an end, got `{line}`"
            )));
        }
        let start = parse_time(fields[0])?;
        let end = match fields[1] {
            "None" => None,
            value => Some(parse_time(value)?),
        };
        let column = |index: usize, default: &str| {
            fields.get(index).copied().unwrap_or(default).to_string()
        };
        Ok(Some(Self {
            start,
            end,
            entry: column(2, FACTORY),
            frontend: column(3, ALL),
            security_class: column(4, ALL),
            comment: comment.filter(|c| !c.is_empty()),
        }))
    }

    pub fn to_line(&self) -> String {
        let end = self.end.map(format_time).unwrap_or_else(|| "None".to_string());
        let mut line = format!(
            "{:<30} {:<30} {} {} {}",
            format_time(self.start),
            end,
            self.entry,
            self.frontend,
            self.security_class
        );
        if let Some(comment) = &self.comment {
            line.push_str(" # ");
            line.push_str(comment);
        }
        line
    }

    pub fn is_active(&self, at: i64) -> bool {
        at >= self.start && self.end.is_none_or(|end| at <= end)
    }

    /// `frontend` and `security_class` set to `None` ask about the entry as a whole, which is
    /// only covered by windows with the `All` wildcard in those columns.
    pub fn applies_to(&self, entry: &str, frontend: Option<&str>, security_class: Option<&str>) -> bool {
        let entry_matches = if self.entry == ALL {
            entry != FACTORY
        } else {
            self.entry == entry
        };
        let column_matches =
            |column: &str, value: Option<&str>| column == ALL || value.is_some_and(|v| v == column);
        entry_matches
            && column_matches(&self.frontend, frontend)
            && column_matches(&self.security_class, security_class)
    }

    /// Like [`applies_to`](Self::applies_to), also counting factory-wide windows.
    pub fn covers(&self, entry: &str, frontend: Option<&str>, security_class: Option<&str>) -> bool {
        self.applies_to(entry, frontend, security_class)
            || self.applies_to(FACTORY, frontend, security_class)
    }
}

/// Result of reading a downtime file.
#[derive(Debug, Default)]
pub struct DowntimeContent {
    pub periods: Vec<DowntimePeriod>,
    /// Line numbers and errors of lines that were skipped.
    pub malformed: Vec<(usize, String)>,
}

#[derive(Debug, Clone)]
pub struct DowntimeFile {
    path: PathBuf,
}

impl DowntimeFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_text(&self) -> crate::Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn lock(&self) -> crate::Result<Flock<File>> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            GwmsError::GenericError(format!(
                "Cannot lock downtime file {}: {errno}",
                self.path.display()
            ))
        })
    }

    pub fn read_all(&self) -> crate::Result<DowntimeContent> {
        let mut content = DowntimeContent::default();
        for (index, line) in self.read_text()?.lines().enumerate() {
            match DowntimePeriod::parse_line(line) {
                Ok(Some(period)) => content.periods.push(period),
                Ok(None) => {}
                Err(error) => content.malformed.push((index + 1, error.to_string())),
            }
        }
        Ok(content)
    }

    /// Valid windows; malformed lines are skipped.
    pub fn read(&self) -> crate::Result<Vec<DowntimePeriod>> {
        let content = self.read_all()?;
        for (line, error) in &content.malformed {
            log::warn!("Skipping line {line} of {}: {error}", self.path.display());
        }
        Ok(content.periods)
    }

    /// Returns the comment of the first window active at `at`, if any.
    pub fn check(
        &self,
        entry: &str,
        frontend: Option<&str>,
        security_class: Option<&str>,
        at: i64,
    ) -> crate::Result<Option<String>> {
        Ok(self
            .read()?
            .into_iter()
            .find(|p| p.applies_to(entry, frontend, security_class) && p.is_active(at))
            .map(|p| p.comment.unwrap_or_default()))
    }

    pub fn add_period(&self, period: &DowntimePeriod) -> crate::Result<()> {
        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", period.to_line())?;
        file.flush()?;
        Ok(())
    }

    /// Closes at `at` every window matching the selectors that is still open then.
    /// Returns the number of closed windows.
    pub fn end_downtime(
        &self,
        at: i64,
        entry: &str,
        frontend: &str,
        security_class: &str,
    ) -> crate::Result<usize> {
        let _lock = self.lock()?;
        let mut closed = 0;
        let mut lines = Vec::new();
        for line in self.read_text()?.lines() {
            let Ok(Some(mut period)) = DowntimePeriod::parse_line(line) else {
                lines.push(line.to_string());
                continue;
            };
            let selected = ((entry == ALL && period.entry != FACTORY) || period.entry == entry)
                && (frontend == ALL || period.frontend == frontend)
                && (security_class == ALL || period.security_class == security_class);
            if selected && period.start <= at && period.end.is_none_or(|end| end > at) {
                period.end = Some(at);
                closed += 1;
                lines.push(period.to_line());
            } else {
                lines.push(line.to_string());
            }
        }
        if closed > 0 {
            self.rewrite(&lines)?;
        }
        Ok(closed)
    }

    /// Drops windows that ended before `cutoff`. Returns the number of dropped windows.
    pub fn purge_old_periods(&self, cutoff: i64) -> crate::Result<usize> {
        let _lock = self.lock()?;
        let mut purged = 0;
        let mut lines = Vec::new();
        for line in self.read_text()?.lines() {
            if let Ok(Some(period)) = DowntimePeriod::parse_line(line) {
                if period.end.is_some_and(|end| end < cutoff) {
                    purged += 1;
                    continue;
                }
            }
            lines.push(line.to_string());
        }
        if purged > 0 {
            self.rewrite(&lines)?;
        }
        Ok(purged)
    }

    fn rewrite(&self, lines: &[String]) -> crate::Result<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        write_atomic(&self.path, content.as_bytes(), 0o644)
    }
}
