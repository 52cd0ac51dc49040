//! Host names, the hosts file and the recent-connections file
//!
//! A host name has the form `[prefix:]*[luname@]hostname[:port]`. Each
//! one-letter prefix selects a connection mode:
//!
//! | Prefix | Meaning |
//! |---|---|
//! | `A:` | NVT (ANSI) mode only |
//! | `C:` | no login string |
//! | `L:` | TLS from the start |
//! | `N:` | refuse TN3270E |
//! | `P:` | passthru |
//! | `S:` | standard data stream (no extended terminal type) |
//!
//! Square brackets quote `:` and `@` inside a name (`[::1]:23`) and a
//! backslash quotes any single character.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};

use crate::error::{HostError, HostResult};

/// Longest LU name kept from a host name
pub const LUNAME_SIZE: usize = 16;

/// Entries kept in the recent-connections file
pub const MAX_RECENT: usize = 5;

/// Prefix letters, in bit order
const PREFIXES: [char; 6] = ['A', 'C', 'L', 'N', 'P', 'S'];

/// Connection modes selected by host name prefixes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostQualifiers {
    pub ansi: bool,
    pub no_login: bool,
    pub secure: bool,
    pub non_tn3270e: bool,
    pub passthru: bool,
    pub std_ds: bool,
}

impl HostQualifiers {
    fn from_bits(bits: u8) -> Self {
        Self {
            ansi: bits & 0x01 != 0,
            no_login: bits & 0x02 != 0,
            secure: bits & 0x04 != 0,
            non_tn3270e: bits & 0x08 != 0,
            passthru: bits & 0x10 != 0,
            std_ds: bits & 0x20 != 0,
        }
    }
}

/// A parsed host name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub qualifiers: HostQualifiers,
    pub lu: Option<String>,
    pub host: String,
    pub port: Option<String>,
}

fn syntax(msg: &str) -> HostError {
    HostError::Syntax(msg.to_string())
}

impl HostSpec {
    /// Parse a host name, returning a syntax error naming the problem
    pub fn parse(raw: &str) -> HostResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(syntax("empty string"));
        }

        // Unquote: each character with whether it was quoted. Backslashes
        // and brackets are consumed here.
        let chars: Vec<char> = trimmed.chars().collect();
        let mut uq: Vec<(char, bool)> = Vec::with_capacity(chars.len());
        let mut quoted = false;
        let mut bracketed = false;
        for (i, &c) in chars.iter().enumerate() {
            if c.is_whitespace() {
                return Err(syntax("contains whitespace"));
            }
            if quoted {
                uq.push((c, true));
                quoted = false;
                continue;
            }
            if c == '\\' {
                quoted = true;
                continue;
            }
            if bracketed {
                match c {
                    ':' | '@' => {
                        uq.push((c, true));
                        continue;
                    }
                    '[' => return Err(syntax("nested '['")),
                    ']' => {
                        // Must be followed by the end, ':' or '@'
                        match chars.get(i + 1) {
                            None | Some(':') | Some('@') => bracketed = false,
                            Some(_) => return Err(syntax("text following ']'")),
                        }
                        continue;
                    }
                    _ => {}
                }
            } else if c == '[' {
                // Must be preceded by the start, an unquoted ':' or '@'
                // A bracketed literal replaces whatever plain text precedes it
                // in the same component: `lu@host[::1]` names `::1`
                let keep = uq
                    .iter()
                    .rposition(|&(c, q)| !q && (c == ':' || c == '@'))
                    .map_or(0, |i| i + 1);
                if keep < uq.len() {
                    debug!("Hostname text before '[' ignored");
                    uq.truncate(keep);
                }
                bracketed = true;
                continue;
            }
            uq.push((c, false));
        }
        if quoted {
            return Err(syntax("dangling '\\'"));
        }
        if bracketed {
            return Err(syntax("missing ']'"));
        }
        if uq.is_empty() {
            return Err(syntax("empty hostname"));
        }

        // Prefixes
        let mut bits = 0u8;
        let mut start = 0;
        while let (Some(&(p, _)), Some(&(':', false))) = (uq.get(start), uq.get(start + 1)) {
            match PREFIXES.iter().position(|&x| x == p.to_ascii_uppercase()) {
                Some(ix) => bits |= 1 << ix,
                None => break,
            }
            start += 2;
        }
        let rest = &uq[start..];

        // [LUname@]hostname[:port]
        let (mut n_ch, mut n_at, mut n_colon) = (0, 0, 0);
        for &(c, q) in rest {
            match (c, q) {
                ('@', false) => {
                    if n_ch == 0 {
                        return Err(syntax("empty LU name"));
                    }
                    if n_colon > 0 {
                        return Err(syntax("'@' after ':'"));
                    }
                    if n_at > 0 {
                        return Err(syntax("double '@'"));
                    }
                    n_at += 1;
                    n_ch = 0;
                }
                (':', false) => {
                    if n_ch == 0 {
                        return Err(syntax("empty hostname"));
                    }
                    if n_colon > 0 {
                        return Err(syntax("double ':'"));
                    }
                    n_colon += 1;
                    n_ch = 0;
                }
                _ => n_ch += 1,
            }
        }
        if n_ch == 0 {
            return Err(syntax(if n_colon > 0 { "empty port" } else { "empty hostname" }));
        }

        let mut parts: Vec<String> = vec![String::new()];
        for &(c, q) in rest {
            if !q && (c == '@' || c == ':') {
                parts.push(String::new());
            } else if let Some(last) = parts.last_mut() {
                last.push(c);
            }
        }
        let mut parts = parts.into_iter();
        let lu = if n_at > 0 { parts.next() } else { None };
        let host = parts.next().unwrap_or_default();
        let port = if n_colon > 0 { parts.next() } else { None };

        Ok(Self {
            qualifiers: HostQualifiers::from_bits(bits),
            lu: lu.map(|l| l.chars().take(LUNAME_SIZE).collect()),
            host,
            port,
        })
    }

    /// Canonical `[L:]host:port` form, bracketing hosts that contain ':'
    pub fn qualified_host(&self, default_port: &str) -> String {
        let port = self.port.as_deref().unwrap_or(default_port);
        let secure = if self.qualifiers.secure { "L:" } else { "" };
        if self.host.contains(':') {
            format!("{secure}[{}]:{port}", self.host)
        } else {
            format!("{secure}{}:{port}", self.host)
        }
    }
}

impl FromStr for HostSpec {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Kind of host list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Primary,
    Alias,
    Recent,
}

/// One hosts-file or recent-connections entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    /// Menu hierarchy above the name, outermost first
    pub parents: Vec<String>,
    pub hostname: String,
    pub entry_type: EntryType,
    pub login_string: Option<String>,
    pub connect_time: Option<DateTime<Utc>>,
}

impl HostEntry {
    fn recent(name: &str, when: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            parents: Vec::new(),
            hostname: name.to_string(),
            entry_type: EntryType::Recent,
            login_string: None,
            connect_time: Some(when),
        }
    }
}

/// Split a hierarchical `a>b>name` label into the name and its parents.
/// Empty components make the label invalid.
pub fn split_hier(label: &str) -> Option<(String, Vec<String>)> {
    let mut parts: Vec<String> = label.split('>').map(str::to_string).collect();
    if parts.iter().any(String::is_empty) {
        return None;
    }
    let name = parts.pop()?;
    Some((name, parts))
}

/// The hosts file (`ibm_hosts`): primary entries and aliases
#[derive(Debug, Clone, Default)]
pub struct HostsFile {
    entries: Vec<HostEntry>,
}

impl HostsFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a hosts file. A missing file is an empty list.
    pub fn load(path: &Path) -> HostResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No hosts file at {}", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(HostError::HostsFileIo(e)),
        }
    }

    /// Parse hosts-file text: `name entry-type hostname [login-string]`
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut rest = line;
            let mut fields = Vec::with_capacity(3);
            for _ in 0..3 {
                let token_end = rest.find([' ', '\t']).unwrap_or(rest.len());
                let token = &rest[..token_end];
                if token.is_empty() {
                    break;
                }
                fields.push(token);
                rest = rest[token_end..].trim_start_matches([' ', '\t']);
            }
            let [name, entry_type, hostname] = fields[..] else {
                warn!("Bad hosts file syntax, entry skipped");
                continue;
            };
            let Some((name, parents)) = split_hier(name) else {
                continue;
            };
            entries.push(HostEntry {
                name,
                parents,
                // host/port is accepted for host:port
                hostname: hostname.replacen('/', ":", 1),
                entry_type: if entry_type == "primary" { EntryType::Primary } else { EntryType::Alias },
                login_string: (!rest.is_empty()).then(|| rest.to_string()),
                connect_time: None,
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    /// Find an entry by exact name
    pub fn lookup(&self, name: &str) -> Option<&HostEntry> {
        self.entries
            .iter()
            .find(|h| h.entry_type != EntryType::Recent && h.name == name)
    }
}

/// The recent-connections list and the file that persists it
#[derive(Debug, Clone, Default)]
pub struct RecentFile {
    /// `None` disables persistence
    path: Option<PathBuf>,
    entries: Vec<HostEntry>,
}

impl RecentFile {
    /// A recent list persisted at `path`; the name `none` disables the file
    pub fn new(path: Option<PathBuf>) -> Self {
        let path = path.filter(|p| !p.as_os_str().eq_ignore_ascii_case("none"));
        Self { path, entries: Vec::new() }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Newest first
    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    /// Load the list from the file without rewriting it
    pub fn load(&mut self) -> HostResult<()> {
        let from_file = self.read_file()?;
        self.merge(from_file);
        Ok(())
    }

    /// Record a connection to `name` (if given), merge in entries other
    /// sessions have written, and rewrite the file.
    pub fn save_recent(&mut self, name: Option<&str>, now: DateTime<Utc>) -> HostResult<()> {
        let mut added: Vec<HostEntry> = name.map(|n| HostEntry::recent(n, now)).into_iter().collect();
        added.append(&mut self.entries);
        self.entries = added;
        let from_file = self.read_file()?;
        self.merge(from_file);
        self.write_file(now)
    }

    /// Sort newest first, drop duplicate names, keep at most MAX_RECENT
    fn merge(&mut self, mut more: Vec<HostEntry>) {
        self.entries.append(&mut more);
        self.entries.sort_by(|a, b| b.connect_time.cmp(&a.connect_time));
        let mut kept: Vec<HostEntry> = Vec::with_capacity(MAX_RECENT);
        for entry in self.entries.drain(..) {
            if kept.len() >= MAX_RECENT {
                break;
            }
            if !kept.iter().any(|k| k.name == entry.name) {
                kept.push(entry);
            }
        }
        self.entries = kept;
    }

    fn read_file(&self) -> HostResult<Vec<HostEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HostError::RecentFileIo(e)),
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((stamp, name)) = line.split_once(' ') else {
                continue;
            };
            let Ok(secs) = stamp.parse::<i64>() else {
                continue;
            };
            if secs == 0 || name.is_empty() {
                continue;
            }
            if let Some(when) = Utc.timestamp_opt(secs, 0).single() {
                entries.push(HostEntry::recent(name, when));
            }
        }
        Ok(entries)
    }

    fn write_file(&self, now: DateTime<Utc>) -> HostResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut out = format!(
            "# Automatically generated {}\n# by tn3270r {}\n# Do not edit!\n",
            now.format("%a %b %e %H:%M:%S %Y"),
            env!("CARGO_PKG_VERSION")
        );
        for entry in &self.entries {
            if let Some(when) = entry.connect_time {
                out.push_str(&format!("{} {}\n", when.timestamp(), entry.name));
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(HostError::RecentFileIo)?;
        }
        fs::write(path, out).map_err(HostError::RecentFileIo)
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for parent in &self.parents {
            write!(f, "{parent}>")?;
        }
        write!(f, "{}", self.name)
    }
}
